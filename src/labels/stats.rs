use std::collections::BTreeMap;

use serde::Serialize;

use crate::labels::condition::{ConditionMap, SeverityLevel};
use crate::labels::record::ImageRecord;

/// Label distribution of a record set.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub total_samples: usize,
    pub condition_counts: ConditionMap<usize>,
    /// Share of samples with the condition present, in percent.
    pub condition_percentages: ConditionMap<f64>,
    /// Severity tag counts over present conditions only.
    pub severity_counts: BTreeMap<SeverityLevel, usize>,
}

pub fn analyze_distribution(records: &[ImageRecord]) -> DistributionReport {
    let mut condition_counts: ConditionMap<usize> = ConditionMap::default();
    let mut severity_counts: BTreeMap<SeverityLevel, usize> =
        SeverityLevel::ALL.iter().map(|&l| (l, 0)).collect();

    for record in records {
        for (condition, &present) in record.condition_labels().iter() {
            if present {
                condition_counts[condition] += 1;
            }
        }
        for severity in record.severity_labels().values().flatten() {
            *severity_counts.entry(severity.level()).or_insert(0) += 1;
        }
    }

    let total = records.len();
    let condition_percentages = condition_counts.map(|_, &count| {
        if total == 0 { 0.0 } else { count as f64 / total as f64 * 100.0 }
    });

    DistributionReport {
        total_samples: total,
        condition_counts,
        condition_percentages,
        severity_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::condition::{Condition, ConditionSeverity};
    use std::path::PathBuf;

    fn record(condition: Condition, level: SeverityLevel) -> ImageRecord {
        ImageRecord::new(
            PathBuf::from("x.png"),
            ConditionMap::from_fn(|c| c == condition),
            ConditionMap::from_fn(|c| ConditionSeverity::new(c, level)),
            0.9,
        )
    }

    #[test]
    fn counts_presence_and_severity() {
        let records = vec![
            record(Condition::Acne, SeverityLevel::Mild),
            record(Condition::Acne, SeverityLevel::Severe),
            record(Condition::Aging, SeverityLevel::EarlySigns),
            record(Condition::Redness, SeverityLevel::Mild),
        ];
        let report = analyze_distribution(&records);
        assert_eq!(report.total_samples, 4);
        assert_eq!(report.condition_counts[Condition::Acne], 2);
        assert_eq!(report.condition_percentages[Condition::Acne], 50.0);
        assert_eq!(report.severity_counts[&SeverityLevel::Mild], 2);
        assert_eq!(report.severity_counts[&SeverityLevel::EarlySigns], 1);
        assert_eq!(report.severity_counts[&SeverityLevel::Advanced], 0);
    }

    #[test]
    fn empty_input_reports_zero_percentages() {
        let report = analyze_distribution(&[]);
        assert_eq!(report.total_samples, 0);
        assert!(report.condition_percentages.values().all(|&p| p == 0.0));
    }
}
