pub mod accumulator;

pub use accumulator::{ConditionMetrics, EvaluationMetrics, MetricsAccumulator, PRESENCE_THRESHOLD};
