pub mod error;
pub mod logging;
pub mod math;
pub mod activation;
pub mod labels;
pub mod data;
pub mod layers;
pub mod network;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod train;
pub mod inference;

// Convenience re-exports
pub use error::{Error, Result};
pub use math::matrix::Matrix;
pub use activation::activation::ActivationFunction;
pub use labels::{Condition, ConditionMap, ConditionSeverity, ImageRecord, LabelStore, SeverityLevel};
pub use data::{split_records, DatasetSplits, ImageTensor, Pipeline};
pub use layers::dense::Layer;
pub use network::{Architecture, ModelSpec, SkinClassifier};
pub use loss::CombinedLoss;
pub use metrics::{EvaluationMetrics, MetricsAccumulator};
pub use train::{train_loop, ModelCheckpoint, TrainConfig, TrainingSession};
pub use inference::{InferenceService, SeverityStrategy, ServeConfig};
