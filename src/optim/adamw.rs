use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::matrix::Matrix;
use crate::network::backbone::FeatureExtractor;
use crate::network::classifier::{ClassifierGradients, SkinClassifier};

/// Adam with decoupled weight decay.
///
/// Moment estimates are stored in the same shape as the model's gradients,
/// so the whole optimizer state serializes into a checkpoint and a resumed
/// run continues with identical updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamW {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    step: u64,
    first: ClassifierGradients,
    second: ClassifierGradients,
}

impl AdamW {
    pub fn new<B: FeatureExtractor>(model: &SkinClassifier<B>, weight_decay: f64) -> AdamW {
        AdamW {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            step: 0,
            first: model.zero_gradients(),
            second: model.zero_gradients(),
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Applies one update with learning rate `lr`.
    pub fn step<B: FeatureExtractor>(
        &mut self,
        model: &mut SkinClassifier<B>,
        grads: &ClassifierGradients,
        lr: f64,
    ) -> Result<()> {
        let aligned = grads.iter().count() == self.first.iter().count()
            && grads.iter().zip(self.first.iter()).all(|(g, m)| {
                g.weights.same_shape(&m.weights) && g.biases.same_shape(&m.biases)
            });
        if !aligned {
            return Err(Error::Shape("gradients do not match the optimizer state".to_string()));
        }

        self.step += 1;
        let t = self.step as i32;
        let hyper = Hyper {
            lr,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            weight_decay: self.weight_decay,
            bias1: 1.0 - self.beta1.powi(t),
            bias2: 1.0 - self.beta2.powi(t),
        };

        let slots = model.parameters_mut()
            .zip(grads.iter())
            .zip(self.first.iter_mut().zip(self.second.iter_mut()));
        for ((layer, g), (m, v)) in slots {
            update(&mut layer.weights, &g.weights, &mut m.weights, &mut v.weights, &hyper);
            update(&mut layer.biases, &g.biases, &mut m.biases, &mut v.biases, &hyper);
        }
        Ok(())
    }
}

struct Hyper {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    bias1: f64,
    bias2: f64,
}

fn update(param: &mut Matrix, grad: &Matrix, m: &mut Matrix, v: &mut Matrix, h: &Hyper) {
    let rows = param.data.iter_mut()
        .zip(grad.data.iter())
        .zip(m.data.iter_mut().zip(v.data.iter_mut()));
    for ((p_row, g_row), (m_row, v_row)) in rows {
        let cells = p_row.iter_mut()
            .zip(g_row.iter())
            .zip(m_row.iter_mut().zip(v_row.iter_mut()));
        for ((p, &g), (m, v)) in cells {
            *m = h.beta1 * *m + (1.0 - h.beta1) * g;
            *v = h.beta2 * *v + (1.0 - h.beta2) * g * g;
            let m_hat = *m / h.bias1;
            let v_hat = *v / h.bias2;
            *p *= 1.0 - h.lr * h.weight_decay;
            *p -= h.lr * m_hat / (v_hat.sqrt() + h.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::spec::{Architecture, ModelSpec};
    use approx::assert_abs_diff_eq;

    fn model() -> SkinClassifier {
        let spec = ModelSpec { architecture: Architecture::GridPoolSmall, head_hidden: 4, dropout: 0.0 };
        SkinClassifier::new(spec, 11).unwrap()
    }

    #[test]
    fn first_step_moves_each_weight_by_about_lr() {
        let mut model = model();
        let mut before = model.clone();
        let mut grads = model.zero_gradients();
        for g in grads.iter_mut() {
            g.weights.data[0][0] = 0.5;
        }
        let mut opt = AdamW::new(&model, 0.0);
        opt.step(&mut model, &grads, 1e-3).unwrap();
        assert_eq!(opt.steps(), 1);

        let moved = model.parameters_mut().next().unwrap().weights.data[0][0];
        let original = before.parameters_mut().next().unwrap().weights.data[0][0];
        // Bias-corrected first step is lr · sign(g).
        assert_abs_diff_eq!(original - moved, 1e-3, epsilon = 1e-9);
    }

    #[test]
    fn weight_decay_shrinks_weights_without_gradient() {
        let mut model = model();
        let original = model.parameters_mut().next().unwrap().weights.data[1][1];
        let grads = model.zero_gradients();
        let mut opt = AdamW::new(&model, 0.1);
        opt.step(&mut model, &grads, 0.5).unwrap();
        let after = model.parameters_mut().next().unwrap().weights.data[1][1];
        assert_abs_diff_eq!(after, original * (1.0 - 0.05), epsilon = 1e-12);
    }

    #[test]
    fn mismatched_gradients_are_rejected() {
        let mut model = model();
        let mut opt = AdamW::new(&model, 0.0);
        let mut grads = model.zero_gradients();
        grads.backbone.clear();
        assert!(matches!(opt.step(&mut model, &grads, 1e-3), Err(Error::Shape(_))));
        assert_eq!(opt.steps(), 0);
    }
}
