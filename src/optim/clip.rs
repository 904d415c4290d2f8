use crate::network::classifier::ClassifierGradients;

/// Rescales `grads` in place so their global L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut ClassifierGradients, max_norm: f64) -> f64 {
    let norm = grads.norm();
    if norm.is_finite() && norm > max_norm {
        grads.scale(max_norm / (norm + 1e-6));
    }
    norm
}
