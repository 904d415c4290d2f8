use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::layers::dense::{Init, Layer, LayerGradients, LayerTrace};
use crate::network::spec::LayerSpec;

/// A feed-forward stack of dense layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub layers: Vec<Layer>,
}

impl Network {
    /// Builds a network from layer specs, drawing weights from `rng`.
    pub fn new<R: Rng + ?Sized>(layer_specs: &[LayerSpec], init: Init, rng: &mut R) -> Network {
        let layers = layer_specs.iter()
            .map(|s| Layer::new(s.size, s.input_size, s.activation, init, rng))
            .collect();
        Network { layers }
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.size).unwrap_or(0)
    }

    /// Forward pass recording every layer's trace; the last trace holds the output.
    pub fn forward(&self, input: &[f64]) -> Result<Vec<LayerTrace>> {
        let mut traces: Vec<LayerTrace> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let trace = match traces.last() {
                Some(prev) => layer.feed_from(&prev.output)?,
                None => layer.feed_from(input)?,
            };
            traces.push(trace);
        }
        Ok(traces)
    }

    pub fn zero_gradients(&self) -> Vec<LayerGradients> {
        self.layers.iter().map(LayerGradients::zeros_like).collect()
    }

    /// Backward pass. `pre_delta` is ∂L/∂z of the output layer (the combined
    /// loss + output-activation gradient). Accumulates into `grads` and
    /// returns ∂L/∂input.
    pub fn backward(&self, traces: &[LayerTrace], pre_delta: Vec<f64>, grads: &mut [LayerGradients]) -> Vec<f64> {
        let mut delta = pre_delta;
        for i in (0..self.layers.len()).rev() {
            let upstream = self.layers[i].backprop(&traces[i], &delta, &mut grads[i]);
            if i == 0 {
                return upstream;
            }
            delta = self.layers[i - 1].activation_delta(&traces[i - 1], &upstream);
        }
        delta
    }

    /// Checks that the stack matches `specs` layer for layer.
    pub fn check_shapes(&self, specs: &[LayerSpec]) -> Result<()> {
        if self.layers.len() != specs.len() {
            return Err(Error::Shape(format!(
                "expected {} layers, found {}", specs.len(), self.layers.len()
            )));
        }
        for (i, (layer, spec)) in self.layers.iter().zip(specs).enumerate() {
            let ok = layer.size == spec.size
                && layer.activator == spec.activation
                && layer.weights.rows == spec.input_size
                && layer.weights.cols == spec.size
                && layer.weights.data.len() == spec.input_size
                && layer.weights.data.iter().all(|row| row.len() == spec.size)
                && layer.biases.rows == 1
                && layer.biases.data.len() == 1
                && layer.biases.data[0].len() == spec.size;
            if !ok {
                return Err(Error::Shape(format!(
                    "layer {} does not match {}→{} {:?}", i, spec.input_size, spec.size, spec.activation
                )));
            }
        }
        Ok(())
    }
}
