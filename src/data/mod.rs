pub mod augment;
pub mod loader;
pub mod split;
pub mod tensor;

pub use augment::{Pipeline, Transform, IMAGENET_MEAN, IMAGENET_STD};
pub use loader::{Batch, BatchLoader};
pub use split::{split_records, DatasetSplits, SplitFractions};
pub use tensor::ImageTensor;
