use serde::{Serialize, Deserialize};

use crate::loss::bce::BceLoss;
use crate::loss::focal::FocalLoss;

/// Selects the presence loss.
///
/// - `Focal`: focal loss on each sigmoid output; the default, for the
///   heavily imbalanced condition labels.
/// - `Bce`: plain binary cross-entropy.
///
/// Both report their gradient w.r.t. the pre-sigmoid logit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceLoss {
    Focal(FocalLoss),
    Bce,
}

impl Default for PresenceLoss {
    fn default() -> Self {
        PresenceLoss::Focal(FocalLoss::default())
    }
}

impl PresenceLoss {
    pub fn loss(&self, p: f64, y: f64) -> f64 {
        match self {
            PresenceLoss::Focal(focal) => focal.loss(p, y),
            PresenceLoss::Bce => BceLoss::loss(p, y),
        }
    }

    pub fn logit_gradient(&self, p: f64, y: f64) -> f64 {
        match self {
            PresenceLoss::Focal(focal) => focal.logit_gradient(p, y),
            PresenceLoss::Bce => BceLoss::logit_gradient(p, y),
        }
    }
}
