use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::labels::{Condition, ConditionMap, IGNORE_INDEX};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::loss::loss_type::PresenceLoss;

/// Loss values of a batch (or one sample's share of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// `condition_weight · presence + severity_weight · severity`.
    pub total: f64,
    pub presence: f64,
    pub severity: f64,
}

impl LossBreakdown {
    pub fn accumulate(&mut self, other: &LossBreakdown) {
        self.total += other.total;
        self.presence += other.presence;
        self.severity += other.severity;
    }

    pub fn scaled(&self, factor: f64) -> LossBreakdown {
        LossBreakdown {
            total: self.total * factor,
            presence: self.presence * factor,
            severity: self.severity * factor,
        }
    }
}

/// Batch-wide denominators. Computed from the targets alone so each sample
/// can be processed independently while the sum over samples still equals
/// the batch mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossNormalizer {
    /// `B × 7` presence terms.
    pub presence_terms: usize,
    /// Severity targets that are not the ignore sentinel.
    pub severity_terms: usize,
}

impl LossNormalizer {
    pub fn from_targets(presence_targets: &[ConditionMap<f64>], severity_targets: &[ConditionMap<i64>]) -> Self {
        LossNormalizer {
            presence_terms: presence_targets.len() * Condition::ALL.len(),
            severity_terms: severity_targets
                .iter()
                .flat_map(|t| t.values())
                .filter(|&&t| t != IGNORE_INDEX)
                .count(),
        }
    }
}

/// One sample's contribution to the batch loss with the matching gradients.
#[derive(Debug, Clone)]
pub struct SampleLoss {
    pub contribution: LossBreakdown,
    /// ∂total/∂logit per presence head.
    pub presence_delta: ConditionMap<f64>,
    /// ∂total/∂logits per severity head; all zeros for ignored targets.
    pub severity_delta: ConditionMap<Vec<f64>>,
}

/// Presence loss averaged over every (sample, condition) pair plus severity
/// cross-entropy averaged over valid targets only. A batch with no valid
/// severity target contributes exactly zero severity loss and gradient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedLoss {
    pub presence: PresenceLoss,
    pub condition_weight: f64,
    pub severity_weight: f64,
}

impl Default for CombinedLoss {
    fn default() -> Self {
        CombinedLoss { presence: PresenceLoss::default(), condition_weight: 1.0, severity_weight: 0.5 }
    }
}

impl CombinedLoss {
    pub fn new(presence: PresenceLoss, condition_weight: f64, severity_weight: f64) -> CombinedLoss {
        CombinedLoss { presence, condition_weight, severity_weight }
    }

    pub fn sample(
        &self,
        probabilities: &ConditionMap<f64>,
        severity_logits: &ConditionMap<Vec<f64>>,
        presence_target: &ConditionMap<f64>,
        severity_target: &ConditionMap<i64>,
        norm: &LossNormalizer,
    ) -> Result<SampleLoss> {
        let mut contribution = LossBreakdown::default();
        let mut presence_delta = ConditionMap::from_fn(|_| 0.0);
        let mut severity_delta = severity_logits.map(|_, logits| vec![0.0; logits.len()]);

        let presence_terms = norm.presence_terms.max(1) as f64;
        for condition in Condition::ALL {
            let (p, y) = (probabilities[condition], presence_target[condition]);
            contribution.presence += self.presence.loss(p, y) / presence_terms;
            presence_delta[condition] =
                self.condition_weight * self.presence.logit_gradient(p, y) / presence_terms;
        }

        if norm.severity_terms > 0 {
            let severity_terms = norm.severity_terms as f64;
            for condition in Condition::ALL {
                let target = severity_target[condition];
                if target == IGNORE_INDEX {
                    continue;
                }
                let logits = &severity_logits[condition];
                let class = checked_class(condition, target, logits.len())?;
                contribution.severity += CrossEntropyLoss::loss(logits, class) / severity_terms;
                severity_delta[condition] = CrossEntropyLoss::logit_gradient(logits, class)
                    .into_iter()
                    .map(|g| self.severity_weight * g / severity_terms)
                    .collect();
            }
        }

        contribution.total =
            self.condition_weight * contribution.presence + self.severity_weight * contribution.severity;
        Ok(SampleLoss { contribution, presence_delta, severity_delta })
    }

    /// Loss of a whole batch, without gradients.
    pub fn batch(
        &self,
        probabilities: &[ConditionMap<f64>],
        severity_logits: &[ConditionMap<Vec<f64>>],
        presence_targets: &[ConditionMap<f64>],
        severity_targets: &[ConditionMap<i64>],
    ) -> Result<LossBreakdown> {
        let n = probabilities.len();
        if severity_logits.len() != n || presence_targets.len() != n || severity_targets.len() != n {
            return Err(Error::Shape(format!(
                "batch has {} predictions, {} severity outputs, {} presence and {} severity targets",
                n, severity_logits.len(), presence_targets.len(), severity_targets.len()
            )));
        }
        let norm = LossNormalizer::from_targets(presence_targets, severity_targets);
        let mut total = LossBreakdown::default();
        for i in 0..n {
            let sample = self.sample(
                &probabilities[i], &severity_logits[i], &presence_targets[i], &severity_targets[i], &norm,
            )?;
            total.accumulate(&sample.contribution);
        }
        Ok(total)
    }
}

fn checked_class(condition: Condition, target: i64, classes: usize) -> Result<usize> {
    if target < 0 || target as usize >= classes {
        return Err(Error::Shape(format!(
            "severity target {} out of range for {} ({} classes)", target, condition, classes
        )));
    }
    Ok(target as usize)
}
