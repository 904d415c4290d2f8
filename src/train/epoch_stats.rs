use serde::{Serialize, Deserialize};

use crate::loss::combined::LossBreakdown;
use crate::metrics::EvaluationMetrics;

/// Per-epoch training statistics emitted by `train_loop`.
///
/// When a progress sender is passed to `train_loop`, one `EpochStats` value
/// is sent at the end of every completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Mean over training batches.
    pub train_loss: LossBreakdown,
    /// Mean over validation batches.
    pub val_loss: LossBreakdown,
    pub train_macro_f1: f64,
    pub val_macro_f1: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    /// Rate used for this epoch's updates.
    pub learning_rate: f64,
    /// Validation macro-F1 improved and the best checkpoint was rewritten.
    pub is_best: bool,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}

/// Everything recorded across epochs; persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochStats>,
    pub train_metrics: Vec<EvaluationMetrics>,
    pub val_metrics: Vec<EvaluationMetrics>,
}

impl TrainingHistory {
    pub fn record(&mut self, stats: EpochStats, train: EvaluationMetrics, val: EvaluationMetrics) {
        self.epochs.push(stats);
        self.train_metrics.push(train);
        self.val_metrics.push(val);
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.train_loss.total).collect()
    }

    pub fn val_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss.total).collect()
    }
}
