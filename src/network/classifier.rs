use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Serialize, Deserialize};

use crate::data::tensor::ImageTensor;
use crate::error::{Error, Result};
use crate::labels::{Condition, ConditionMap};
use crate::layers::dense::{Init, Layer, LayerGradients, LayerTrace};
use crate::layers::dropout::DropoutMask;
use crate::network::backbone::{FeatureExtractor, GridPoolBackbone};
use crate::network::network::Network;
use crate::network::spec::ModelSpec;

/// Backbone plus one presence head and one severity head per condition.
///
/// Heads are looked up by [`Condition`], never by position. Every head
/// reads the same pooled feature vector; presence heads end in a sigmoid
/// and are independent of each other, severity heads emit `K_c + 1` raw
/// logits where the last class means "absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinClassifier<B = GridPoolBackbone> {
    spec: ModelSpec,
    backbone: B,
    presence_heads: ConditionMap<Network>,
    severity_heads: ConditionMap<Network>,
}

/// Batch forward result.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutput {
    /// `[B]` maps of sigmoid probabilities.
    pub presence_probabilities: Vec<ConditionMap<f64>>,
    /// `[B]` maps of `K_c + 1` logits.
    pub severity_logits: Vec<ConditionMap<Vec<f64>>>,
    /// `[B, D]`.
    pub pooled_features: Vec<Vec<f64>>,
}

/// Forward state of one head: the dropout mask applied to its input and the
/// per-layer traces.
#[derive(Debug, Clone)]
pub struct HeadTrace {
    pub mask: DropoutMask,
    pub layers: Vec<LayerTrace>,
}

impl HeadTrace {
    pub fn output(&self) -> &[f64] {
        self.layers.last().map(|t| t.output.as_slice()).unwrap_or(&[])
    }

    /// Output-layer pre-activation (the logit for a sigmoid head).
    pub fn logits(&self) -> &[f64] {
        self.layers.last().map(|t| t.pre.as_slice()).unwrap_or(&[])
    }
}

/// Everything one sample's forward pass produced.
pub struct SampleTrace<T> {
    pub backbone: T,
    pub features: Vec<f64>,
    pub presence: ConditionMap<HeadTrace>,
    pub severity: ConditionMap<HeadTrace>,
}

impl<T> SampleTrace<T> {
    pub fn presence_probabilities(&self) -> ConditionMap<f64> {
        self.presence.map(|_, head| head.output().first().copied().unwrap_or(0.0))
    }

    pub fn severity_logits(&self) -> ConditionMap<Vec<f64>> {
        self.severity.map(|_, head| head.output().to_vec())
    }
}

/// Parameter-shaped storage for the whole classifier. Also reused for the
/// optimizer's moment estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierGradients {
    pub backbone: Vec<LayerGradients>,
    pub presence: ConditionMap<Vec<LayerGradients>>,
    pub severity: ConditionMap<Vec<LayerGradients>>,
}

impl ClassifierGradients {
    pub fn zeros_like<B: FeatureExtractor>(model: &SkinClassifier<B>) -> ClassifierGradients {
        ClassifierGradients {
            backbone: model.backbone.layers().iter().map(LayerGradients::zeros_like).collect(),
            presence: model.presence_heads.map(|_, head| head.zero_gradients()),
            severity: model.severity_heads.map(|_, head| head.zero_gradients()),
        }
    }

    /// Backbone layers, then presence heads, then severity heads, each in
    /// condition order. Matches [`SkinClassifier::parameters_mut`].
    pub fn iter(&self) -> impl Iterator<Item = &LayerGradients> {
        self.backbone.iter()
            .chain(self.presence.values().flatten())
            .chain(self.severity.values().flatten())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LayerGradients> {
        self.backbone.iter_mut()
            .chain(self.presence.values_mut().flatten())
            .chain(self.severity.values_mut().flatten())
    }

    pub fn scale(&mut self, factor: f64) {
        for g in self.iter_mut() {
            g.scale(factor);
        }
    }

    /// Global L2 norm over every parameter gradient.
    pub fn norm(&self) -> f64 {
        self.iter().map(LayerGradients::squared_norm).sum::<f64>().sqrt()
    }
}

impl SkinClassifier<GridPoolBackbone> {
    /// Builds a freshly initialized classifier. The same seed always yields
    /// the same weights.
    pub fn new(spec: ModelSpec, seed: u64) -> Result<Self> {
        spec.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let backbone = GridPoolBackbone::new(&spec, &mut rng);
        Ok(SkinClassifier::with_backbone(spec, backbone, &mut rng))
    }

    /// Verifies every layer against the stored spec, e.g. after loading a
    /// checkpoint from disk.
    pub fn check_shapes(&self) -> Result<()> {
        self.backbone.check_shapes(&self.spec)?;
        self.check_head_shapes()
    }
}

impl<B: FeatureExtractor> SkinClassifier<B> {
    /// Attaches freshly initialized heads to an existing backbone.
    pub fn with_backbone<R: Rng + ?Sized>(spec: ModelSpec, backbone: B, rng: &mut R) -> Self {
        let d = backbone.feature_dim();
        let presence_heads = ConditionMap::from_fn(|_| {
            Network::new(&spec.presence_head_layers(d), Init::XavierUniform, rng)
        });
        let severity_heads = ConditionMap::from_fn(|c| {
            Network::new(&spec.severity_head_layers(c, d), Init::XavierUniform, rng)
        });
        SkinClassifier { spec, backbone, presence_heads, severity_heads }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn presence_head(&self, condition: Condition) -> &Network {
        &self.presence_heads[condition]
    }

    pub fn severity_head(&self, condition: Condition) -> &Network {
        &self.severity_heads[condition]
    }

    fn check_head_shapes(&self) -> Result<()> {
        let d = self.backbone.feature_dim();
        for condition in Condition::ALL {
            self.presence_heads[condition]
                .check_shapes(&self.spec.presence_head_layers(d))
                .map_err(|e| Error::Shape(format!("{} presence head: {}", condition, e)))?;
            self.severity_heads[condition]
                .check_shapes(&self.spec.severity_head_layers(condition, d))
                .map_err(|e| Error::Shape(format!("{} severity head: {}", condition, e)))?;
        }
        Ok(())
    }

    /// Evaluation-mode forward pass for one image.
    pub fn trace(&self, image: &ImageTensor) -> Result<SampleTrace<B::Trace>> {
        self.trace_with(image, DropoutMask::identity)
    }

    /// Training-mode forward pass: every head input gets its own dropout mask.
    pub fn trace_with_dropout<R: Rng + ?Sized>(&self, image: &ImageTensor, rng: &mut R) -> Result<SampleTrace<B::Trace>> {
        let rate = self.spec.dropout;
        self.trace_with(image, |len| DropoutMask::sample(len, rate, rng))
    }

    fn trace_with<F>(&self, image: &ImageTensor, mut mask_for: F) -> Result<SampleTrace<B::Trace>>
    where
        F: FnMut(usize) -> DropoutMask,
    {
        let backbone = self.backbone.forward(image)?;
        let features = B::features(&backbone).to_vec();

        let mut run_head = |head: &Network| -> Result<HeadTrace> {
            let mask = mask_for(features.len());
            let layers = head.forward(&mask.apply(&features))?;
            Ok(HeadTrace { mask, layers })
        };
        let presence = ConditionMap::try_from_fn(|c| run_head(&self.presence_heads[c]))?;
        let severity = ConditionMap::try_from_fn(|c| run_head(&self.severity_heads[c]))?;

        Ok(SampleTrace { backbone, features, presence, severity })
    }

    /// Batch forward pass without side effects.
    pub fn forward(&self, images: &[ImageTensor]) -> Result<ClassifierOutput> {
        let mut out = ClassifierOutput {
            presence_probabilities: Vec::with_capacity(images.len()),
            severity_logits: Vec::with_capacity(images.len()),
            pooled_features: Vec::with_capacity(images.len()),
        };
        for image in images {
            let trace = self.trace(image)?;
            out.presence_probabilities.push(trace.presence_probabilities());
            out.severity_logits.push(trace.severity_logits());
            out.pooled_features.push(trace.features);
        }
        Ok(out)
    }

    pub fn zero_gradients(&self) -> ClassifierGradients {
        ClassifierGradients::zeros_like(self)
    }

    /// Accumulates one sample's parameter gradients.
    ///
    /// `presence_delta` is ∂L/∂logit per presence head; `severity_delta` is
    /// ∂L/∂logits per severity head.
    pub fn backward(
        &self,
        trace: &SampleTrace<B::Trace>,
        presence_delta: &ConditionMap<f64>,
        severity_delta: &ConditionMap<Vec<f64>>,
        grads: &mut ClassifierGradients,
    ) {
        let mut feature_grad = vec![0.0; trace.features.len()];
        for condition in Condition::ALL {
            let head = &trace.presence[condition];
            let input_grad = self.presence_heads[condition]
                .backward(&head.layers, vec![presence_delta[condition]], &mut grads.presence[condition]);
            add_assign(&mut feature_grad, &head.mask.apply(&input_grad));

            let head = &trace.severity[condition];
            let input_grad = self.severity_heads[condition]
                .backward(&head.layers, severity_delta[condition].clone(), &mut grads.severity[condition]);
            add_assign(&mut feature_grad, &head.mask.apply(&input_grad));
        }
        self.backbone.backward(&trace.backbone, &feature_grad, &mut grads.backbone);
    }

    /// All trainable layers in the order used by [`ClassifierGradients::iter`].
    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.backbone.layers_mut().iter_mut()
            .chain(self.presence_heads.values_mut().flat_map(|n| n.layers.iter_mut()))
            .chain(self.severity_heads.values_mut().flat_map(|n| n.layers.iter_mut()))
    }

    pub fn parameter_count(&self) -> usize {
        self.backbone.layers().iter()
            .chain(self.presence_heads.values().flat_map(|n| n.layers.iter()))
            .chain(self.severity_heads.values().flat_map(|n| n.layers.iter()))
            .map(|l| l.weights.rows * l.weights.cols + l.biases.cols)
            .sum()
    }
}

fn add_assign(acc: &mut [f64], v: &[f64]) {
    for (a, x) in acc.iter_mut().zip(v.iter()) {
        *a += x;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::spec::Architecture;
    use approx::assert_abs_diff_eq;

    fn small_spec() -> ModelSpec {
        ModelSpec { architecture: Architecture::GridPoolSmall, head_hidden: 8, dropout: 0.3 }
    }

    fn image(seed: usize) -> ImageTensor {
        let data = (0..8 * 8 * 3).map(|i| (((i * 31 + seed * 17) % 97) as f64 / 48.0) - 1.0).collect();
        ImageTensor::new(8, 8, data).unwrap()
    }

    #[test]
    fn forward_shapes() {
        let model = SkinClassifier::new(small_spec(), 1).unwrap();
        let out = model.forward(&[image(0), image(1)]).unwrap();
        assert_eq!(out.presence_probabilities.len(), 2);
        assert_eq!(out.pooled_features[0].len(), 64);
        for condition in Condition::ALL {
            let p = out.presence_probabilities[0][condition];
            assert!((0.0..=1.0).contains(&p));
            assert_eq!(out.severity_logits[1][condition].len(), condition.severity_classes());
        }
    }

    #[test]
    fn forward_is_pure_and_seeded() {
        let a = SkinClassifier::new(small_spec(), 5).unwrap();
        let b = SkinClassifier::new(small_spec(), 5).unwrap();
        assert_eq!(a, b);
        let first = a.forward(&[image(2)]).unwrap();
        let second = a.forward(&[image(2)]).unwrap();
        assert_eq!(first, second);
        assert!(a.check_shapes().is_ok());
    }

    #[test]
    fn gradients_line_up_with_parameters() {
        let mut model = SkinClassifier::new(small_spec(), 2).unwrap();
        let grads = model.zero_gradients();
        let shapes: Vec<_> = grads.iter().map(|g| (g.weights.rows, g.weights.cols)).collect();
        let params: Vec<_> = model.parameters_mut().map(|l| (l.weights.rows, l.weights.cols)).collect();
        assert_eq!(shapes, params);
        assert_eq!(params.len(), 1 + 2 * 7 + 2 * 7);
    }

    #[test]
    fn backward_matches_finite_differences_on_a_head_weight() {
        let model = SkinClassifier::new(small_spec(), 3).unwrap();
        let img = image(4);
        // L = logit of the acne presence head + first redness severity logit.
        let loss = |m: &SkinClassifier| {
            let t = m.trace(&img).unwrap();
            t.presence[Condition::Acne].logits()[0] + t.severity[Condition::Redness].output()[0]
        };

        let trace = model.trace(&img).unwrap();
        let mut presence_delta = ConditionMap::from_fn(|_| 0.0);
        presence_delta[Condition::Acne] = 1.0;
        let severity_delta = ConditionMap::from_fn(|c| {
            let mut d = vec![0.0; c.severity_classes()];
            if c == Condition::Redness {
                d[0] = 1.0;
            }
            d
        });
        let mut grads = model.zero_gradients();
        model.backward(&trace, &presence_delta, &severity_delta, &mut grads);

        let h = 1e-6;
        for (r, c) in [(0, 0), (3, 5), (10, 2)] {
            let mut plus = model.clone();
            plus.backbone.layers_mut()[0].weights.data[r][c] += h;
            let mut minus = model.clone();
            minus.backbone.layers_mut()[0].weights.data[r][c] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(grads.backbone[0].weights.data[r][c], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn dropout_only_in_training_traces() {
        let model = SkinClassifier::new(small_spec(), 9).unwrap();
        let img = image(1);
        let eval = model.trace(&img).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let train = model.trace_with_dropout(&img, &mut rng).unwrap();
        assert_eq!(eval.features, train.features);
        let eval_input = &eval.presence[Condition::Acne].layers[0].input;
        let train_input = &train.presence[Condition::Acne].layers[0].input;
        assert_eq!(eval_input, &eval.features);
        assert_ne!(train_input, eval_input);
    }
}
