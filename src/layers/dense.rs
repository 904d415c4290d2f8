use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::{math::matrix::Matrix, activation::activation::ActivationFunction};
use crate::error::{Error, Result};

/// Weight initialization scheme for a freshly built layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// Gaussian He init; for layers followed by ReLU.
    He,
    /// Uniform Xavier init.
    XavierUniform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer{
    pub size: usize,
    pub weights: Matrix,
    pub biases: Matrix,
    pub activator: ActivationFunction
}

/// Values recorded by a forward pass that backprop needs again.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    pub input: Vec<f64>,
    /// Pre-activation values (z = xW + b); derivatives are evaluated here.
    pub pre: Vec<f64>,
    pub output: Vec<f64>,
}

/// Gradient (or optimizer moment) storage shaped like one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerGradients {
    pub weights: Matrix,
    pub biases: Matrix,
}

impl LayerGradients {
    pub fn zeros_like(layer: &Layer) -> LayerGradients {
        LayerGradients {
            weights: Matrix::zeros(layer.weights.rows, layer.weights.cols),
            biases: Matrix::zeros(layer.biases.rows, layer.biases.cols),
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.weights.scale(factor);
        self.biases.scale(factor);
    }

    pub fn squared_norm(&self) -> f64 {
        self.weights.squared_norm() + self.biases.squared_norm()
    }
}

impl Layer {
    /// Builds a layer with seeded random weights and zero biases.
    pub fn new<R: Rng + ?Sized>(
        size: usize,
        input_size: usize,
        activation: ActivationFunction,
        init: Init,
        rng: &mut R,
    ) -> Layer {
        let weights = match init {
            Init::He => Matrix::he(input_size, size, rng),
            Init::XavierUniform => Matrix::xavier_uniform(input_size, size, rng),
        };
        Layer {
            size,
            weights,
            biases: Matrix::zeros(1, size),
            activator: activation
        }
    }

    /// Forward pass for one sample. Leaves the layer untouched.
    pub fn feed_from(&self, input: &[f64]) -> Result<LayerTrace> {
        let mut pre = self.weights.vec_mul(input)?;
        let bias = self.biases.data.first()
            .ok_or_else(|| Error::Shape("layer has no bias row".to_string()))?;
        for (z, b) in pre.iter_mut().zip(bias.iter()) {
            *z += b;
        }
        let output = pre.iter().map(|&z| self.activator.function(z)).collect();
        Ok(LayerTrace { input: input.to_vec(), pre, output })
    }

    /// Turns ∂L/∂a (error in activation space) into ∂L/∂z: δ = error ⊙ σ'(z).
    pub fn activation_delta(&self, trace: &LayerTrace, upstream: &[f64]) -> Vec<f64> {
        upstream.iter().zip(trace.pre.iter())
            .map(|(e, &z)| e * self.activator.derivative(z))
            .collect()
    }

    /// Accumulates gradients for ∂L/∂z = `pre_delta` and returns ∂L/∂input.
    pub fn backprop(&self, trace: &LayerTrace, pre_delta: &[f64], grads: &mut LayerGradients) -> Vec<f64> {
        grads.weights.add_outer(&trace.input, pre_delta);
        grads.biases.add_row(pre_delta);
        self.weights.mul_vec(pre_delta)
    }
}
