use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::data::split::SplitFractions;
use crate::error::{Error, Result};
use crate::loss::combined::CombinedLoss;
use crate::loss::focal::FocalLoss;
use crate::loss::loss_type::PresenceLoss;
use crate::network::spec::{Architecture, ModelSpec};

/// Where the model runs. Only CPU execution is implemented; `Auto`
/// resolves to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
}

impl Device {
    pub fn resolve(self) -> Device {
        if self == Device::Auto {
            info!("Device 'auto' resolved to cpu");
        }
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
        })
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            other if other.starts_with("cuda") || other == "mps" => Err(Error::Config(format!(
                "device '{}' is not available in this build; use 'cpu' or 'auto'", s
            ))),
            _ => Err(Error::Config(format!("unknown device '{}'", s))),
        }
    }
}

/// Hyperparameters and paths for a training run.
///
/// Every field has a default, so a JSON file only needs the keys it
/// changes. Runtime hooks such as the progress channel are passed to
/// `train_loop` directly and are not part of this (serializable) struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub architecture: Architecture,
    pub head_hidden: usize,
    pub dropout: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    pub image_size: usize,
    pub device: Device,
    pub condition_weight: f64,
    pub severity_weight: f64,
    pub use_focal_loss: bool,
    pub focal_alpha: f64,
    pub focal_gamma: f64,
    pub max_grad_norm: f64,
    /// Floor of the cosine schedule.
    pub lr_floor: f64,
    pub train_fraction: f64,
    pub val_fraction: f64,
    pub seed: u64,
    pub num_workers: usize,
    /// Batches buffered between loader workers and the training thread.
    pub prefetch: usize,
    pub checkpoint_dir: PathBuf,
    /// A periodic checkpoint is written every this many epochs.
    pub checkpoint_every: usize,
    /// Early stopping is only considered after this epoch.
    pub early_stop_after_epoch: usize,
    /// Validation macro-F1 below which training stops early.
    pub early_stop_min_f1: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            architecture: Architecture::default(),
            head_hidden: 64,
            dropout: 0.3,
            batch_size: 32,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            epochs: 100,
            image_size: 224,
            device: Device::Auto,
            condition_weight: 1.0,
            severity_weight: 0.5,
            use_focal_loss: true,
            focal_alpha: 1.0,
            focal_gamma: 2.0,
            max_grad_norm: 1.0,
            lr_floor: 1e-6,
            train_fraction: 0.7,
            val_fraction: 0.15,
            seed: 42,
            num_workers: 4,
            prefetch: 8,
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_every: 10,
            early_stop_after_epoch: 20,
            early_stop_min_f1: 0.3,
        }
    }
}

impl TrainConfig {
    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec { architecture: self.architecture, head_hidden: self.head_hidden, dropout: self.dropout }
    }

    pub fn loss(&self) -> CombinedLoss {
        let presence = if self.use_focal_loss {
            PresenceLoss::Focal(FocalLoss::new(self.focal_alpha, self.focal_gamma))
        } else {
            PresenceLoss::Bce
        };
        CombinedLoss::new(presence, self.condition_weight, self.severity_weight)
    }

    pub fn split_fractions(&self) -> SplitFractions {
        SplitFractions { train: self.train_fraction, val: self.val_fraction }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("image_size", self.image_size),
            ("checkpoint_every", self.checkpoint_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be at least 1", name)));
            }
        }
        if !(self.learning_rate > 0.0) || self.lr_floor < 0.0 || self.lr_floor > self.learning_rate {
            return Err(Error::Config(format!(
                "learning rate {} and floor {} must satisfy 0 <= floor <= rate, rate > 0",
                self.learning_rate, self.lr_floor
            )));
        }
        if self.weight_decay < 0.0 || self.condition_weight < 0.0 || self.severity_weight < 0.0 {
            return Err(Error::Config("weights and decay must be non-negative".to_string()));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(Error::Config("max_grad_norm must be positive".to_string()));
        }
        self.model_spec().validate()?;
        self.split_fractions().validate()
    }

    /// Reads a config file; missing keys take their defaults.
    pub fn load_json(path: &Path) -> Result<TrainConfig> {
        let reader = BufReader::new(File::open(path)?);
        let config: TrainConfig = serde_json::from_reader(reader)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.loss().severity_weight, 0.5);
        assert!(matches!(config.loss().presence, PresenceLoss::Focal(_)));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("train.json");
        std::fs::write(&path, r#"{ "epochs": 3, "architecture": "gridpool-s", "use_focal_loss": false }"#).unwrap();
        let config = TrainConfig::load_json(&path).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.architecture, Architecture::GridPoolSmall);
        assert_eq!(config.learning_rate, 1e-4);
        assert_eq!(config.loss().presence, PresenceLoss::Bce);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let zero_batch = TrainConfig { batch_size: 0, ..TrainConfig::default() };
        assert!(matches!(zero_batch.validate(), Err(Error::Config(_))));
        let bad_split = TrainConfig { train_fraction: 0.95, ..TrainConfig::default() };
        assert!(matches!(bad_split.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn cuda_is_rejected_with_a_clear_message() {
        let err = "cuda".parse::<Device>().unwrap_err();
        assert!(err.to_string().contains("not available"));
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(Device::Auto.resolve(), Device::Cpu);
    }

    #[test]
    fn save_then_load_is_lossless() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.json");
        let config = TrainConfig { seed: 7, image_size: 64, ..TrainConfig::default() };
        config.save_json(&path).unwrap();
        assert_eq!(TrainConfig::load_json(&path).unwrap(), config);
    }
}
