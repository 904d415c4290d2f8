use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::{Error, Result};
use crate::labels::Condition;

/// Describes one layer in a network specification.
///
/// Fields:
/// - `size`: number of neurons in this layer
/// - `input_size`: number of neurons feeding into this layer
/// - `activation`: activation function applied after the linear transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub size: usize,
    pub input_size: usize,
    pub activation: ActivationFunction,
}

/// Named backbone configurations.
///
/// A grid-pool backbone summarizes the image as per-cell channel mean and
/// standard deviation over a `grid × grid` partition, then projects that
/// summary to `feature_dim` features with a trainable ReLU layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "gridpool-s")]
    GridPoolSmall,
    #[default]
    #[serde(rename = "gridpool-m")]
    GridPoolMedium,
    #[serde(rename = "gridpool-l")]
    GridPoolLarge,
}

impl Architecture {
    pub const ALL: [Architecture; 3] =
        [Architecture::GridPoolSmall, Architecture::GridPoolMedium, Architecture::GridPoolLarge];

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::GridPoolSmall  => "gridpool-s",
            Architecture::GridPoolMedium => "gridpool-m",
            Architecture::GridPoolLarge  => "gridpool-l",
        }
    }

    pub fn grid(self) -> usize {
        match self {
            Architecture::GridPoolSmall  => 4,
            Architecture::GridPoolMedium => 8,
            Architecture::GridPoolLarge  => 16,
        }
    }

    /// Length of the pooled feature vector (D).
    pub fn feature_dim(self) -> usize {
        match self {
            Architecture::GridPoolSmall  => 64,
            Architecture::GridPoolMedium => 128,
            Architecture::GridPoolLarge  => 256,
        }
    }

    /// Length of the fixed pooling summary: mean and std per channel per cell.
    pub fn pooled_dim(self) -> usize {
        self.grid() * self.grid() * 3 * 2
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Config(format!(
                "unknown architecture '{}' (expected gridpool-s, gridpool-m or gridpool-l)", s
            )))
    }
}

/// A fully serializable description of the classifier: backbone choice,
/// head width and dropout rate. Stored alongside the weights in every
/// checkpoint so a mismatched file is detected at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub architecture: Architecture,
    /// Hidden width of every presence and severity head.
    pub head_hidden: usize,
    /// Dropout rate on each head's input while training.
    pub dropout: f64,
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec { architecture: Architecture::default(), head_hidden: 64, dropout: 0.3 }
    }
}

impl ModelSpec {
    pub fn backbone_layers(&self) -> Vec<LayerSpec> {
        vec![LayerSpec {
            size: self.architecture.feature_dim(),
            input_size: self.architecture.pooled_dim(),
            activation: ActivationFunction::ReLU,
        }]
    }

    /// D → hidden (ReLU) → 1 (Sigmoid).
    pub fn presence_head_layers(&self, feature_dim: usize) -> Vec<LayerSpec> {
        vec![
            LayerSpec {
                size: self.head_hidden,
                input_size: feature_dim,
                activation: ActivationFunction::ReLU,
            },
            LayerSpec { size: 1, input_size: self.head_hidden, activation: ActivationFunction::Sigmoid },
        ]
    }

    /// D → hidden (ReLU) → K_c + 1 raw logits.
    pub fn severity_head_layers(&self, condition: Condition, feature_dim: usize) -> Vec<LayerSpec> {
        vec![
            LayerSpec {
                size: self.head_hidden,
                input_size: feature_dim,
                activation: ActivationFunction::ReLU,
            },
            LayerSpec {
                size: condition.severity_classes(),
                input_size: self.head_hidden,
                activation: ActivationFunction::Identity,
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_hidden == 0 {
            return Err(Error::Config("head_hidden must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        Ok(())
    }
}
