/// Binary cross-entropy on a sigmoid output.
pub struct BceLoss;

pub(crate) const EPS: f64 = 1e-12;

impl BceLoss {
    /// Scalar BCE for one probability / target pair:
    /// -(y·log(p+ε) + (1-y)·log(1-p+ε))
    pub fn loss(p: f64, y: f64) -> f64 {
        -(y * (p + EPS).ln() + (1.0 - y) * (1.0 - p + EPS).ln())
    }

    /// Gradient of the combined Sigmoid + BCE w.r.t. the pre-sigmoid logit.
    ///
    /// The chain σ'(z) · ∂L/∂p collapses to `p - y`, so the trainer feeds
    /// this straight into the output layer's pre-activation delta.
    pub fn logit_gradient(p: f64, y: f64) -> f64 {
        p - y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn confident_correct_prediction_costs_little() {
        assert!(BceLoss::loss(0.999, 1.0) < 0.01);
        assert!(BceLoss::loss(0.001, 1.0) > 6.0);
        assert!(BceLoss::loss(0.0, 1.0).is_finite());
    }

    #[test]
    fn logit_gradient_matches_finite_differences() {
        let sigmoid = |z: f64| 1.0 / (1.0 + (-z).exp());
        for &(z, y) in &[(0.3, 1.0), (-1.2, 0.0), (2.0, 0.0)] {
            let h = 1e-6;
            let numeric = (BceLoss::loss(sigmoid(z + h), y) - BceLoss::loss(sigmoid(z - h), y)) / (2.0 * h);
            assert_abs_diff_eq!(BceLoss::logit_gradient(sigmoid(z), y), numeric, epsilon = 1e-6);
        }
    }
}
