use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::classifier::SkinClassifier;
use crate::optim::{AdamW, CosineAnnealing};
use crate::train::epoch_stats::TrainingHistory;
use crate::train::train_config::TrainConfig;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Rewritten whenever validation macro-F1 improves.
pub const BEST_MODEL_FILE: &str = "best_model.json";

/// Written once when a run ends, however it ends.
pub const FINAL_MODEL_FILE: &str = "final_model.json";

/// Periodic checkpoint name for a 1-based epoch.
pub fn epoch_checkpoint_file(epoch: usize) -> String {
    format!("checkpoint_epoch_{}.json", epoch)
}

/// Everything needed to resume a run or serve its model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub format_version: u32,
    /// Completed epochs when this file was written.
    pub epoch: usize,
    pub model: SkinClassifier,
    pub optimizer: AdamW,
    pub scheduler: CosineAnnealing,
    pub history: TrainingHistory,
    pub best_val_f1: Option<f64>,
    pub best_epoch: Option<usize>,
    pub config: TrainConfig,
}

impl ModelCheckpoint {
    /// Writes to a sibling temporary file first and renames it into place,
    /// so readers never observe a half-written checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = temporary_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        debug!("Wrote checkpoint {}", path.display());
        Ok(())
    }

    /// Reads and validates a checkpoint. Every failure, including a model
    /// whose layers disagree with its own spec, is a checkpoint error.
    pub fn load(path: &Path) -> Result<ModelCheckpoint> {
        let file = File::open(path)
            .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))?;
        let checkpoint: ModelCheckpoint = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))?;

        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "{}: format version {} is not supported (expected {})",
                path.display(), checkpoint.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        checkpoint
            .model
            .check_shapes()
            .map_err(|e| Error::Checkpoint(format!("{}: {}", path.display(), e)))?;
        Ok(checkpoint)
    }

    /// Loads only the weights, e.g. for inference.
    pub fn load_model(path: &Path) -> Result<SkinClassifier> {
        ModelCheckpoint::load(path).map(|c| c.model)
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
