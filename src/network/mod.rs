pub mod backbone;
pub mod classifier;
pub mod network;
pub mod spec;

pub use backbone::{FeatureExtractor, GridPoolBackbone};
pub use classifier::{ClassifierGradients, ClassifierOutput, SkinClassifier};
pub use network::Network;
pub use spec::{Architecture, LayerSpec, ModelSpec};
