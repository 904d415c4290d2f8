use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::labels::condition::{ConditionMap, ConditionSeverity, SeverityLevel};
use crate::labels::record::ImageRecord;

const DEFAULT_CONFIDENCE: f64 = 0.5;

/// The subset of the per-image JSON sidecar the classifier consumes.
#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(default)]
    classification_targets: HashMap<String, bool>,
    #[serde(default)]
    severity_targets: HashMap<String, String>,
    #[serde(default)]
    training_annotations: TrainingAnnotations,
}

#[derive(Debug, Deserialize)]
struct TrainingAnnotations {
    #[serde(default = "default_confidence")]
    confidence_score: f64,
}

impl Default for TrainingAnnotations {
    fn default() -> Self {
        TrainingAnnotations { confidence_score: DEFAULT_CONFIDENCE }
    }
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

/// Counts gathered while walking the corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Images without a sibling `.json` file.
    pub missing_annotation: usize,
    /// Images whose sidecar exists but cannot be parsed.
    pub malformed_annotation: usize,
    /// Present conditions whose severity tag is missing or outside the
    /// condition's vocabulary; their severity target becomes the ignore index.
    pub unknown_severity: usize,
}

impl LoadReport {
    pub fn skipped(&self) -> usize {
        self.missing_annotation + self.malformed_annotation
    }
}

/// Reads the `root/<condition>/<severity>/*.png` corpus.
#[derive(Debug, Clone)]
pub struct LabelStore {
    root: PathBuf,
}

impl LabelStore {
    pub fn new(root: impl Into<PathBuf>) -> LabelStore {
        LabelStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Column view of [`load_records`](Self::load_records): image paths,
    /// presence labels and severity labels in matching order.
    #[allow(clippy::type_complexity)]
    pub fn load_dataset(
        &self,
    ) -> Result<(Vec<PathBuf>, Vec<ConditionMap<bool>>, Vec<ConditionMap<Option<ConditionSeverity>>>)> {
        let (records, _) = self.load_records()?;
        let paths = records.iter().map(|r| r.image_path().clone()).collect();
        let labels = records.iter().map(|r| r.condition_labels().clone()).collect();
        let severities = records.iter().map(|r| r.severity_labels().clone()).collect();
        Ok((paths, labels, severities))
    }

    /// Walks the corpus and returns one record per annotated image.
    ///
    /// Only an unreadable root (or condition/severity directory) is an error.
    /// Unannotated images are skipped and counted in the report. Directory
    /// entries are visited in sorted order so the record list, and therefore
    /// every seeded split derived from it, is stable across platforms.
    pub fn load_records(&self) -> Result<(Vec<ImageRecord>, LoadReport)> {
        let mut records = Vec::new();
        let mut report = LoadReport::default();

        for condition_path in sorted_entries(&self.root)? {
            if !condition_path.is_dir() || is_summary_entry(&condition_path) {
                continue;
            }
            debug!("Loading data from {}", condition_path.display());

            for severity_path in sorted_entries(&condition_path)? {
                if !severity_path.is_dir() {
                    continue;
                }
                for image_path in sorted_entries(&severity_path)? {
                    if image_path.extension().and_then(|e| e.to_str()) != Some("png") {
                        continue;
                    }
                    let json_path = image_path.with_extension("json");
                    if !json_path.is_file() {
                        report.missing_annotation += 1;
                        continue;
                    }
                    match read_annotation(&json_path) {
                        Ok(annotation) => {
                            records.push(build_record(image_path, annotation, &mut report));
                        }
                        Err(e) => {
                            warn!("Skipping {}: {}", image_path.display(), e);
                            report.malformed_annotation += 1;
                        }
                    }
                }
            }
        }

        report.loaded = records.len();
        if report.skipped() > 0 {
            warn!(
                "Skipped {} images ({} without annotation, {} with malformed annotation)",
                report.skipped(), report.missing_annotation, report.malformed_annotation
            );
        }
        info!("Loaded {} images from {}", report.loaded, self.root.display());
        Ok((records, report))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Corpus(format!("cannot read {}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::Corpus(format!("cannot read {}: {}", dir.display(), e)))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn is_summary_entry(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("json") | Some("md"))
}

fn read_annotation(path: &Path) -> Result<Annotation> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn build_record(image_path: PathBuf, annotation: Annotation, report: &mut LoadReport) -> ImageRecord {
    let presence = ConditionMap::from_fn(|c| {
        annotation.classification_targets.get(c.as_str()).copied().unwrap_or(false)
    });

    let severity = ConditionMap::from_fn(|c| {
        if !presence[c] {
            return None;
        }
        let tagged = annotation
            .severity_targets
            .get(c.as_str())
            .and_then(|tag| tag.parse::<SeverityLevel>().ok())
            .and_then(|level| ConditionSeverity::new(c, level));
        if tagged.is_none() {
            debug!("{}: no usable severity for {}", image_path.display(), c);
            report.unknown_severity += 1;
        }
        tagged
    });

    ImageRecord::new(image_path, presence, severity, annotation.training_annotations.confidence_score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::condition::Condition;
    use tempfile::TempDir;

    fn write_image(dir: &Path, name: &str, annotation: Option<serde_json::Value>) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{name}.png")), b"not decoded by the store").unwrap();
        if let Some(json) = annotation {
            fs::write(dir.join(format!("{name}.json")), json.to_string()).unwrap();
        }
    }

    fn annotation(condition: &str, severity: &str) -> serde_json::Value {
        let mut classification = serde_json::Map::new();
        let mut severities = serde_json::Map::new();
        for c in Condition::ALL {
            let present = c.as_str() == condition;
            classification.insert(c.as_str().into(), present.into());
            severities.insert(c.as_str().into(), (if present { severity } else { "none" }).into());
        }
        serde_json::json!({
            "classification_targets": classification,
            "severity_targets": severities,
            "training_annotations": { "confidence_score": 0.9 }
        })
    }

    #[test]
    fn unreadable_root_is_a_corpus_error() {
        let store = LabelStore::new("/definitely/not/a/corpus");
        assert!(matches!(store.load_records(), Err(Error::Corpus(_))));
    }

    #[test]
    fn skips_unannotated_images_and_summary_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_image(&root.join("acne/mild"), "a", Some(annotation("acne", "mild")));
        write_image(&root.join("acne/mild"), "b", None);
        fs::write(root.join("summary.json"), "{}").unwrap();
        fs::create_dir_all(root.join("notes.md")).unwrap();

        let (records, report) = LabelStore::new(root).load_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(report.missing_annotation, 1);
        assert_eq!(report.loaded, 1);
        assert_eq!(records[0].confidence(), 0.9);
    }

    #[test]
    fn malformed_sidecar_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("redness/severe");
        write_image(&dir, "ok", Some(annotation("redness", "severe")));
        fs::write(dir.join("bad.png"), b"x").unwrap();
        fs::write(dir.join("bad.json"), "{ truncated").unwrap();

        let (records, report) = LabelStore::new(tmp.path()).load_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(report.malformed_annotation, 1);
    }

    #[test]
    fn out_of_vocabulary_severity_becomes_ignored() {
        let tmp = TempDir::new().unwrap();
        write_image(&tmp.path().join("aging/mild"), "x", Some(annotation("aging", "mild")));

        let (records, report) = LabelStore::new(tmp.path()).load_records().unwrap();
        assert!(records[0].is_present(Condition::Aging));
        assert!(records[0].severity_labels()[Condition::Aging].is_none());
        assert_eq!(report.unknown_severity, 1);
    }

    #[test]
    fn missing_confidence_defaults() {
        let tmp = TempDir::new().unwrap();
        let json = serde_json::json!({ "classification_targets": { "acne": true } });
        write_image(&tmp.path().join("acne/moderate"), "x", Some(json));

        let (paths, labels, severities) = LabelStore::new(tmp.path()).load_dataset().unwrap();
        assert_eq!(paths.len(), 1);
        assert!(labels[0][Condition::Acne]);
        assert!(severities[0][Condition::Acne].is_none());
        let (records, _) = LabelStore::new(tmp.path()).load_records().unwrap();
        assert_eq!(records[0].confidence(), DEFAULT_CONFIDENCE);
    }
}
