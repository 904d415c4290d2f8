pub mod checkpoint;
pub mod epoch_stats;
pub mod loop_fn;
pub mod session;
pub mod train_config;

pub use checkpoint::{epoch_checkpoint_file, ModelCheckpoint, BEST_MODEL_FILE, FINAL_MODEL_FILE};
pub use epoch_stats::{EpochStats, TrainingHistory};
pub use loop_fn::{evaluate_records, evaluate_test, train_loop, StopReason, TrainingOutcome};
pub use session::TrainingSession;
pub use train_config::{Device, TrainConfig};
