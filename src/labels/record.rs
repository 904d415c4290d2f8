use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::labels::condition::{Condition, ConditionMap, ConditionSeverity};

/// Severity target meaning "exclude this condition from the severity loss".
pub const IGNORE_INDEX: i64 = -1;

/// One annotated image. Fields are private so the presence/severity
/// consistency invariant established by [`ImageRecord::new`] cannot be broken
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    image_path: PathBuf,
    condition_labels: ConditionMap<bool>,
    severity_labels: ConditionMap<Option<ConditionSeverity>>,
    confidence: f64,
}

impl ImageRecord {
    /// Builds a record, clearing the severity of every condition marked absent.
    pub fn new(
        image_path: PathBuf,
        condition_labels: ConditionMap<bool>,
        mut severity_labels: ConditionMap<Option<ConditionSeverity>>,
        confidence: f64,
    ) -> ImageRecord {
        for (condition, severity) in severity_labels.iter_mut() {
            if !condition_labels[condition] {
                *severity = None;
            }
        }
        ImageRecord { image_path, condition_labels, severity_labels, confidence }
    }

    pub fn image_path(&self) -> &PathBuf {
        &self.image_path
    }

    pub fn condition_labels(&self) -> &ConditionMap<bool> {
        &self.condition_labels
    }

    pub fn severity_labels(&self) -> &ConditionMap<Option<ConditionSeverity>> {
        &self.severity_labels
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn is_present(&self, condition: Condition) -> bool {
        self.condition_labels[condition]
    }

    /// Binary presence vector.
    pub fn presence_targets(&self) -> ConditionMap<f64> {
        self.condition_labels.map(|_, &present| if present { 1.0 } else { 0.0 })
    }

    /// Per-condition class index, or [`IGNORE_INDEX`] when the condition is
    /// absent or its severity is unknown.
    pub fn severity_targets(&self) -> ConditionMap<i64> {
        self.severity_labels.map(|_, severity| match severity {
            Some(tagged) => tagged.class_index() as i64,
            None => IGNORE_INDEX,
        })
    }
}
