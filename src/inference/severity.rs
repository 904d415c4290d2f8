use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::labels::{Condition, ConditionSeverity};
use crate::math::argmax;

/// Coarse severity derived from a presence probability alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityBucket {
    Mild,
    Moderate,
    Severe,
}

impl SeverityBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            SeverityBucket::Mild     => "mild",
            SeverityBucket::Moderate => "moderate",
            SeverityBucket::Severe   => "severe",
        }
    }
}

impl fmt::Display for SeverityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `< 0.2` mild, `< 0.4` moderate, anything else severe.
pub fn bucket_for_probability(probability: f64) -> SeverityBucket {
    if probability < 0.2 {
        SeverityBucket::Mild
    } else if probability < 0.4 {
        SeverityBucket::Moderate
    } else {
        SeverityBucket::Severe
    }
}

/// Which signal fills the `severity` field of a response.
///
/// `Threshold` buckets the presence probability and never looks at the
/// severity heads. `TrainedHead` reports the severity head's arg-max level
/// instead, falling back to the threshold bucket when the head predicts the
/// absent class. Both values are always computed and available on
/// [`ConditionPrediction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityStrategy {
    #[default]
    Threshold,
    TrainedHead,
}

impl FromStr for SeverityStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "threshold" => Ok(SeverityStrategy::Threshold),
            "trained_head" | "trained-head" | "head" => Ok(SeverityStrategy::TrainedHead),
            _ => Err(Error::Config(format!(
                "unknown severity strategy '{}' (expected threshold or trained_head)", s
            ))),
        }
    }
}

/// Everything the model says about one condition for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionPrediction {
    pub probability: f64,
    pub threshold_bucket: SeverityBucket,
    /// Arg-max of the severity head; `None` when it picks the absent class.
    pub head_severity: Option<ConditionSeverity>,
}

impl ConditionPrediction {
    pub fn new(condition: Condition, probability: f64, severity_logits: &[f64]) -> ConditionPrediction {
        ConditionPrediction {
            probability,
            threshold_bucket: bucket_for_probability(probability),
            head_severity: ConditionSeverity::from_class_index(condition, argmax(severity_logits)),
        }
    }

    /// Severity label for a response under `strategy`.
    pub fn severity_label(&self, strategy: SeverityStrategy) -> &'static str {
        match (strategy, self.head_severity) {
            (SeverityStrategy::TrainedHead, Some(tagged)) => tagged.level().as_str(),
            _ => self.threshold_bucket.as_str(),
        }
    }

    /// `round(probability · 100)`, clamped to 0..=100.
    pub fn percentage(&self) -> u8 {
        (self.probability * 100.0).round().clamp(0.0, 100.0) as u8
    }
}
