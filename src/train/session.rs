use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::loss::combined::CombinedLoss;
use crate::network::classifier::SkinClassifier;
use crate::optim::{AdamW, CosineAnnealing};
use crate::train::checkpoint::{ModelCheckpoint, BEST_MODEL_FILE, CHECKPOINT_FORMAT_VERSION};
use crate::train::epoch_stats::TrainingHistory;
use crate::train::train_config::TrainConfig;

/// All mutable state of one training run.
///
/// Passed by reference into the training loop; nothing about a run lives
/// outside this value, so two sessions never interfere.
#[derive(Debug, Clone)]
pub struct TrainingSession {
    pub config: TrainConfig,
    pub model: SkinClassifier,
    pub optimizer: AdamW,
    pub scheduler: CosineAnnealing,
    pub loss: CombinedLoss,
    /// Completed epochs.
    pub epoch: usize,
    pub best_val_f1: Option<f64>,
    pub best_epoch: Option<usize>,
    pub history: TrainingHistory,
    pub(crate) best_model: Option<SkinClassifier>,
}

impl TrainingSession {
    pub fn new(config: TrainConfig) -> Result<TrainingSession> {
        config.validate()?;
        config.device.resolve();
        let model = SkinClassifier::new(config.model_spec(), config.seed)?;
        info!(
            "Initialized {} classifier with {} parameters",
            config.architecture,
            model.parameter_count()
        );
        Ok(TrainingSession {
            optimizer: AdamW::new(&model, config.weight_decay),
            scheduler: CosineAnnealing::new(config.learning_rate, config.lr_floor, config.epochs),
            loss: config.loss(),
            epoch: 0,
            best_val_f1: None,
            best_epoch: None,
            history: TrainingHistory::default(),
            best_model: None,
            model,
            config,
        })
    }

    /// Restores a run from a checkpoint. The best model is reloaded from the
    /// checkpoint directory when one has been written.
    pub fn resume(path: &Path) -> Result<TrainingSession> {
        let checkpoint = ModelCheckpoint::load(path)?;
        checkpoint.config.validate()?;

        let best_path = checkpoint.config.checkpoint_dir.join(BEST_MODEL_FILE);
        let best_model = if checkpoint.best_epoch.is_some() && best_path.exists() {
            Some(ModelCheckpoint::load_model(&best_path)?)
        } else {
            None
        };
        info!(
            "Resuming from {} after epoch {} (best macro-F1 {:?})",
            path.display(),
            checkpoint.epoch,
            checkpoint.best_val_f1
        );

        Ok(TrainingSession {
            loss: checkpoint.config.loss(),
            config: checkpoint.config,
            model: checkpoint.model,
            optimizer: checkpoint.optimizer,
            scheduler: checkpoint.scheduler,
            epoch: checkpoint.epoch,
            best_val_f1: checkpoint.best_val_f1,
            best_epoch: checkpoint.best_epoch,
            history: checkpoint.history,
            best_model,
        })
    }

    /// Weights from the epoch with the highest validation macro-F1 so far,
    /// or the current weights before any epoch has completed.
    pub fn best_model(&self) -> &SkinClassifier {
        self.best_model.as_ref().unwrap_or(&self.model)
    }

    pub fn to_checkpoint(&self) -> ModelCheckpoint {
        ModelCheckpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch: self.epoch,
            model: self.model.clone(),
            optimizer: self.optimizer.clone(),
            scheduler: self.scheduler,
            history: self.history.clone(),
            best_val_f1: self.best_val_f1,
            best_epoch: self.best_epoch,
            config: self.config.clone(),
        }
    }

    /// Saves the current state under the checkpoint directory.
    pub fn save_checkpoint(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.config.checkpoint_dir.join(file_name);
        self.to_checkpoint().save(&path)?;
        Ok(path)
    }
}
