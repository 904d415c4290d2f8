pub mod bce;
pub mod combined;
pub mod cross_entropy;
pub mod focal;
pub mod loss_type;

pub use bce::BceLoss;
pub use combined::{CombinedLoss, LossBreakdown, LossNormalizer, SampleLoss};
pub use cross_entropy::CrossEntropyLoss;
pub use focal::FocalLoss;
pub use loss_type::PresenceLoss;
