pub mod condition;
pub mod record;
pub mod stats;
pub mod store;

pub use condition::{Condition, ConditionMap, ConditionSeverity, SeverityLevel, NUM_CONDITIONS};
pub use record::{ImageRecord, IGNORE_INDEX};
pub use stats::{analyze_distribution, DistributionReport};
pub use store::{LabelStore, LoadReport};
