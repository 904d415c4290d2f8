use crate::math::softmax;

/// Categorical cross-entropy on raw logits for a single class-index target.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// L = logsumexp(z) − z[target]
    pub fn loss(logits: &[f64], target: usize) -> f64 {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + logits.iter().map(|&z| (z - max).exp()).sum::<f64>().ln();
        lse - logits[target]
    }

    /// Gradient of the combined Softmax + cross-entropy w.r.t. the logits:
    ///   ∂L/∂z_i = softmax(z)_i − 1[i = target]
    pub fn logit_gradient(logits: &[f64], target: usize) -> Vec<f64> {
        let mut grad = softmax(logits);
        grad[target] -= 1.0;
        grad
    }
}
