use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::labels::{Condition, ConditionMap, IGNORE_INDEX};
use crate::math::argmax;

/// A presence probability strictly above this counts as a positive prediction.
pub const PRESENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of samples where the condition is present.
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub per_condition: ConditionMap<ConditionMetrics>,
    pub macro_precision: f64,
    pub macro_recall: f64,
    /// Unweighted mean of the seven per-condition F1 scores.
    pub macro_f1: f64,
    /// Element-wise exact-match rate over all (sample, condition) pairs.
    pub accuracy: f64,
    /// Argmax accuracy of the severity heads over non-ignored targets;
    /// `None` when no sample carried a severity target.
    pub severity_accuracy: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Confusion {
    tp: usize,
    fp: usize,
    fn_: usize,
    tn: usize,
}

/// Streams predictions batch by batch and reduces them to
/// [`EvaluationMetrics`]. Degenerate ratios (no positives predicted, no
/// positives present) resolve to `0.0` rather than NaN.
#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    confusion: ConditionMap<Confusion>,
    samples: usize,
    severity_correct: usize,
    severity_total: usize,
}

impl MetricsAccumulator {
    pub fn new() -> MetricsAccumulator {
        MetricsAccumulator::default()
    }

    pub fn reset(&mut self) {
        *self = MetricsAccumulator::default();
    }

    pub fn update(
        &mut self,
        presence_probabilities: &[ConditionMap<f64>],
        severity_logits: &[ConditionMap<Vec<f64>>],
        presence_targets: &[ConditionMap<f64>],
        severity_targets: &[ConditionMap<i64>],
    ) -> Result<()> {
        let n = presence_probabilities.len();
        if severity_logits.len() != n || presence_targets.len() != n || severity_targets.len() != n {
            return Err(Error::Shape(format!(
                "metrics update with {} predictions but {} severity outputs, {} presence and {} severity targets",
                n, severity_logits.len(), presence_targets.len(), severity_targets.len()
            )));
        }

        for i in 0..n {
            for condition in Condition::ALL {
                let predicted = presence_probabilities[i][condition] > PRESENCE_THRESHOLD;
                let actual = presence_targets[i][condition] > 0.5;
                let cell = &mut self.confusion[condition];
                match (predicted, actual) {
                    (true, true) => cell.tp += 1,
                    (true, false) => cell.fp += 1,
                    (false, true) => cell.fn_ += 1,
                    (false, false) => cell.tn += 1,
                }

                let target = severity_targets[i][condition];
                let logits = &severity_logits[i][condition];
                if target != IGNORE_INDEX && !logits.is_empty() {
                    self.severity_total += 1;
                    if argmax(logits) as i64 == target {
                        self.severity_correct += 1;
                    }
                }
            }
        }
        self.samples += n;
        Ok(())
    }

    pub fn compute(&self) -> EvaluationMetrics {
        let per_condition = self.confusion.map(|_, c| {
            let precision = ratio(c.tp, c.tp + c.fp);
            let recall = ratio(c.tp, c.tp + c.fn_);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ConditionMetrics { precision, recall, f1, support: c.tp + c.fn_ }
        });

        let k = Condition::ALL.len() as f64;
        let mean = |f: fn(&ConditionMetrics) -> f64| per_condition.values().map(f).sum::<f64>() / k;
        let correct: usize = self.confusion.values().map(|c| c.tp + c.tn).sum();

        EvaluationMetrics {
            macro_precision: mean(|m| m.precision),
            macro_recall: mean(|m| m.recall),
            macro_f1: mean(|m| m.f1),
            accuracy: ratio(correct, self.samples * Condition::ALL.len()),
            severity_accuracy: (self.severity_total > 0)
                .then(|| self.severity_correct as f64 / self.severity_total as f64),
            samples: self.samples,
            per_condition,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}
