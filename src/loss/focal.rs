use serde::{Serialize, Deserialize};

use crate::loss::bce::EPS;

/// Focal loss `alpha · (1 - p_t)^gamma · BCE` for one sigmoid output, where
/// `p_t` is the probability assigned to the true label. Easy, confidently
/// correct examples are down-weighted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocalLoss {
    pub alpha: f64,
    pub gamma: f64,
}

impl Default for FocalLoss {
    fn default() -> Self {
        FocalLoss { alpha: 1.0, gamma: 2.0 }
    }
}

impl FocalLoss {
    pub fn new(alpha: f64, gamma: f64) -> FocalLoss {
        FocalLoss { alpha, gamma }
    }

    fn p_t(p: f64, y: f64) -> f64 {
        (y * p + (1.0 - y) * (1.0 - p)).clamp(EPS, 1.0)
    }

    pub fn loss(&self, p: f64, y: f64) -> f64 {
        let pt = Self::p_t(p, y);
        self.alpha * (1.0 - pt).powf(self.gamma) * -pt.ln()
    }

    /// Gradient w.r.t. the pre-sigmoid logit for a binary target:
    /// α(2y−1)·[γ(1−p_t)^γ · p_t · ln p_t − (1−p_t)^(γ+1)]
    pub fn logit_gradient(&self, p: f64, y: f64) -> f64 {
        let pt = Self::p_t(p, y);
        let q = 1.0 - pt;
        let sign = 2.0 * y - 1.0;
        self.alpha * sign * (self.gamma * q.powf(self.gamma) * pt * pt.ln() - q.powf(self.gamma + 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::bce::BceLoss;
    use approx::assert_abs_diff_eq;

    fn sigmoid(z: f64) -> f64 {
        1.0 / (1.0 + (-z).exp())
    }

    #[test]
    fn gamma_zero_reduces_to_bce() {
        let focal = FocalLoss::new(1.0, 0.0);
        for &(p, y) in &[(0.2, 1.0), (0.7, 0.0), (0.5, 1.0)] {
            assert_abs_diff_eq!(focal.loss(p, y), BceLoss::loss(p, y), epsilon = 1e-9);
            assert_abs_diff_eq!(focal.logit_gradient(p, y), BceLoss::logit_gradient(p, y), epsilon = 1e-9);
        }
    }

    #[test]
    fn easy_examples_are_down_weighted() {
        let focal = FocalLoss::default();
        assert!(focal.loss(0.9, 1.0) < 0.1 * BceLoss::loss(0.9, 1.0));
        assert!(focal.loss(0.9, 1.0) < focal.loss(0.1, 1.0));
    }

    #[test]
    fn logit_gradient_matches_finite_differences() {
        let focal = FocalLoss::new(0.8, 2.0);
        for &(z, y) in &[(0.4, 1.0), (-2.0, 1.0), (1.5, 0.0), (-0.3, 0.0)] {
            let h = 1e-6;
            let numeric = (focal.loss(sigmoid(z + h), y) - focal.loss(sigmoid(z - h), y)) / (2.0 * h);
            assert_abs_diff_eq!(focal.logit_gradient(sigmoid(z), y), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn saturated_probabilities_stay_finite() {
        let focal = FocalLoss::default();
        assert!(focal.loss(0.0, 1.0).is_finite());
        assert!(focal.logit_gradient(1.0, 0.0).is_finite());
    }
}
