use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::mpsc;

use image::{Rgb, RgbImage};
use serde_json::json;
use tempfile::TempDir;

use ferrite_derm::data::{split_records, BatchLoader, Pipeline};
use ferrite_derm::inference::{InferenceService, ProportionalFaceLayout, SeverityStrategy};
use ferrite_derm::labels::{analyze_distribution, Condition, LabelStore, SeverityLevel};
use ferrite_derm::network::Architecture;
use ferrite_derm::train::{
    evaluate_test, train_loop, ModelCheckpoint, StopReason, TrainConfig, TrainingSession, BEST_MODEL_FILE,
    FINAL_MODEL_FILE,
};
use ferrite_derm::{Error, ImageTensor};

/// Writes `n` annotated images spread over the conditions, each with one
/// condition present at a severity from its own vocabulary.
fn write_corpus(root: &Path, n: usize) {
    for i in 0..n {
        let condition = Condition::ALL[i % Condition::ALL.len()];
        let vocabulary = condition.vocabulary();
        let level = vocabulary[i % vocabulary.len()];
        let dir = root.join(condition.as_str()).join(level.as_str());
        fs::create_dir_all(&dir).unwrap();

        let shade = (i * 11 % 256) as u8;
        RgbImage::from_fn(12, 10, |x, y| Rgb([shade, (x * 20) as u8, (y * 25) as u8]))
            .save(dir.join(format!("img_{i:03}.png")))
            .unwrap();

        let classification: serde_json::Map<_, _> =
            Condition::ALL.iter().map(|c| (c.as_str().to_string(), json!(*c == condition))).collect();
        let annotation = json!({
            "classification_targets": classification,
            "severity_targets": { condition.as_str(): level.as_str() },
            "training_annotations": { "confidence_score": 0.8 }
        });
        fs::write(dir.join(format!("img_{i:03}.json")), annotation.to_string()).unwrap();
    }
}

fn tiny_config(checkpoint_dir: &Path, epochs: usize) -> TrainConfig {
    TrainConfig {
        architecture: Architecture::GridPoolSmall,
        head_hidden: 4,
        epochs,
        batch_size: 4,
        image_size: 8,
        learning_rate: 5e-3,
        num_workers: 2,
        prefetch: 2,
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        ..TrainConfig::default()
    }
}

fn sample_face() -> ImageTensor {
    ImageTensor::from_rgb(&RgbImage::from_fn(40, 40, |x, y| Rgb([200, (x * 9) as u8, (y * 13) as u8])))
}

#[test]
fn corpus_loads_and_splits_disjointly() {
    let data = TempDir::new().unwrap();
    write_corpus(data.path(), 21);

    let (records, report) = LabelStore::new(data.path()).load_records().unwrap();
    assert_eq!(report.loaded, 21);
    assert_eq!(report.skipped(), 0);
    assert_eq!(report.unknown_severity, 0);

    // A severity label exists exactly when its condition is present.
    for record in &records {
        for c in Condition::ALL {
            assert_eq!(record.is_present(c), record.severity_labels()[c].is_some());
        }
    }

    let dist = analyze_distribution(&records);
    assert_eq!(dist.total_samples, 21);
    assert_eq!(dist.condition_counts[Condition::Acne], 3);
    assert_eq!(dist.severity_counts[&SeverityLevel::EarlySigns], 1);
    assert_eq!(dist.severity_counts[&SeverityLevel::Slight], 1);

    let splits = split_records(records, TrainConfig::default().split_fractions(), 42).unwrap();
    assert_eq!(splits.sizes(), (14, 3, 4));
    let mut seen = HashSet::new();
    for record in splits.train.iter().chain(&splits.val).chain(&splits.test) {
        assert!(seen.insert(record.image_path().clone()));
    }
    assert_eq!(seen.len(), 21);

    // Decoded and resized samples keep their own pixel content.
    let pipeline = Pipeline::eval(8);
    let loader = BatchLoader::new(&splits.train, &pipeline, 14);
    loader
        .for_each_batch(0, |batch| {
            assert_eq!(batch.len(), 14);
            for pair in batch.images.windows(2) {
                assert_ne!(pair[0], pair[1]);
            }
            let first = &batch.images[0];
            let spread = first.data().iter().copied().fold(f64::MIN, f64::max)
                - first.data().iter().copied().fold(f64::MAX, f64::min);
            assert!(spread > 0.5, "spread {}", spread);
            Ok(())
        })
        .unwrap();
}

#[test]
fn trains_checkpoints_and_serves_predictions() {
    let data = TempDir::new().unwrap();
    let ckpt = TempDir::new().unwrap();
    write_corpus(data.path(), 21);
    let (records, _) = LabelStore::new(data.path()).load_records().unwrap();

    let mut session = TrainingSession::new(tiny_config(ckpt.path(), 2)).unwrap();
    let splits = split_records(records, session.config.split_fractions(), session.config.seed).unwrap();
    let (tx, rx) = mpsc::channel();
    let outcome = train_loop(&mut session, &splits, Some(&tx)).unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.epochs_completed, 2);
    assert_eq!(rx.try_iter().count(), 2);
    assert_eq!(session.history.epochs.len(), 2);
    assert!(ckpt.path().join(BEST_MODEL_FILE).is_file());
    assert!(ckpt.path().join("checkpoint_epoch_1.json").is_file());
    assert_eq!(outcome.final_checkpoint, ckpt.path().join(FINAL_MODEL_FILE));

    let (loss, metrics) = evaluate_test(&session, &splits).unwrap();
    assert_eq!(metrics.samples, 4);
    assert!(loss.total.is_finite());

    // Reloaded weights predict exactly what the in-memory model predicts.
    let reloaded = InferenceService::load(&outcome.final_checkpoint, Some(Architecture::GridPoolSmall)).unwrap();
    let live = InferenceService::new(session.model.clone(), session.config.image_size);
    assert_eq!(reloaded.predict(&sample_face()).unwrap(), live.predict(&sample_face()).unwrap());

    let service = reloaded
        .with_strategy(SeverityStrategy::TrainedHead)
        .with_region_locator(Box::new(ProportionalFaceLayout));
    let response = service.predict_image(&sample_face()).unwrap();
    assert_eq!(response.concerns.len(), 7);
    assert_eq!(response.region_concerns.unwrap().len(), 5);
}

#[test]
fn resumed_run_matches_an_uninterrupted_one() {
    let data = TempDir::new().unwrap();
    write_corpus(data.path(), 21);
    let (records, _) = LabelStore::new(data.path()).load_records().unwrap();

    let straight_dir = TempDir::new().unwrap();
    let mut straight = TrainingSession::new(tiny_config(straight_dir.path(), 3)).unwrap();
    let splits = split_records(records, straight.config.split_fractions(), straight.config.seed).unwrap();
    train_loop(&mut straight, &splits, None).unwrap();

    // Dropping the receiver stops the run after its first epoch.
    let resumed_dir = TempDir::new().unwrap();
    let mut first = TrainingSession::new(tiny_config(resumed_dir.path(), 3)).unwrap();
    let (tx, rx) = mpsc::channel();
    drop(rx);
    let outcome = train_loop(&mut first, &splits, Some(&tx)).unwrap();
    assert_eq!(outcome.stop_reason, StopReason::ProgressClosed);
    assert_eq!(outcome.epochs_completed, 1);

    let mut resumed = TrainingSession::resume(&outcome.final_checkpoint).unwrap();
    assert_eq!(resumed.epoch, 1);
    let outcome = train_loop(&mut resumed, &splits, None).unwrap();
    assert_eq!(outcome.epochs_completed, 3);
    assert_eq!(resumed.history.epochs.len(), 3);

    let a = InferenceService::new(straight.model.clone(), 8).predict(&sample_face()).unwrap();
    let b = InferenceService::new(resumed.model.clone(), 8).predict(&sample_face()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn serving_refuses_a_mismatched_or_missing_checkpoint() {
    let ckpt = TempDir::new().unwrap();
    let session = TrainingSession::new(tiny_config(ckpt.path(), 1)).unwrap();
    let path = session.save_checkpoint(FINAL_MODEL_FILE).unwrap();

    let err = InferenceService::load(&path, Some(Architecture::GridPoolLarge)).err().unwrap();
    assert!(matches!(err, Error::Checkpoint(_)));
    let missing = InferenceService::load(&ckpt.path().join("nope.json"), None).err().unwrap();
    assert!(matches!(missing, Error::Checkpoint(_)));

    assert_eq!(ModelCheckpoint::load(&path).unwrap().epoch, 0);
}
