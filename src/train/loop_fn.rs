use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::data::augment::Pipeline;
use crate::data::loader::{Batch, BatchLoader};
use crate::data::split::DatasetSplits;
use crate::error::{Error, Result};
use crate::labels::ImageRecord;
use crate::loss::combined::{CombinedLoss, LossBreakdown, LossNormalizer};
use crate::math::mix_seed;
use crate::metrics::{EvaluationMetrics, MetricsAccumulator};
use crate::network::classifier::SkinClassifier;
use crate::optim::clip_grad_norm;
use crate::train::checkpoint::{epoch_checkpoint_file, BEST_MODEL_FILE, FINAL_MODEL_FILE};
use crate::train::epoch_stats::EpochStats;
use crate::train::session::TrainingSession;
use crate::train::train_config::TrainConfig;

/// Seed stream for dropout masks, kept apart from the augmentation stream.
const DROPOUT_STREAM: u64 = 0xD0;

/// Why `train_loop` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every configured epoch ran.
    Completed,
    /// Validation macro-F1 stayed below the floor past the grace period.
    EarlyStopped,
    /// The progress receiver was dropped.
    ProgressClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub stop_reason: StopReason,
    /// Completed epochs, including any run before a resume.
    pub epochs_completed: usize,
    pub best_val_f1: Option<f64>,
    pub best_epoch: Option<usize>,
    pub final_checkpoint: PathBuf,
}

/// What one epoch produced, before the loop decides about checkpoints.
pub(crate) struct EpochResult {
    pub train_loss: LossBreakdown,
    pub train_metrics: EvaluationMetrics,
    pub val_loss: LossBreakdown,
    pub val_metrics: EvaluationMetrics,
    pub learning_rate: f64,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Trains `session.model` until `session.config.epochs` epochs have completed.
///
/// Each epoch runs one pass of AdamW updates over `splits.train` with
/// augmentation and dropout, then evaluates `splits.val`, steps the cosine
/// schedule and decides about checkpoints:
/// - `best_model.json` whenever validation macro-F1 improves (the first
///   epoch always counts as an improvement)
/// - `checkpoint_epoch_{n}.json` every `checkpoint_every` epochs and on
///   every improvement
/// - `final_model.json` once the loop ends, however it ends
///
/// # Early termination
/// The loop breaks early if:
/// - the `progress_tx` receiver has been dropped, **or**
/// - validation macro-F1 is below `early_stop_min_f1` after epoch
///   `early_stop_after_epoch`.
///
/// # Errors
/// `Error::Config` when there are no training samples; any I/O, image or
/// checkpoint failure aborts the run.
pub fn train_loop(
    session: &mut TrainingSession,
    splits: &DatasetSplits,
    progress_tx: Option<&Sender<EpochStats>>,
) -> Result<TrainingOutcome> {
    if splits.train.is_empty() {
        return Err(Error::Config("no training samples".to_string()));
    }
    if splits.val.is_empty() {
        warn!("Validation split is empty; macro-F1 will read 0.0 every epoch");
    }
    let (train_n, val_n, test_n) = splits.sizes();
    info!("Training on {} samples, validating on {} ({} held out for test)", train_n, val_n, test_n);

    let config = session.config.clone();
    let train_pipeline = Pipeline::train(config.image_size);
    let eval_pipeline = Pipeline::eval(config.image_size);
    let train_loader = BatchLoader::new(&splits.train, &train_pipeline, config.batch_size)
        .shuffled(config.seed)
        .workers(config.num_workers, config.prefetch);
    let val_loader = BatchLoader::new(&splits.val, &eval_pipeline, config.batch_size)
        .seed(config.seed)
        .workers(config.num_workers, config.prefetch);

    drive_epochs(session, progress_tx, |session, epoch| {
        let learning_rate = session.scheduler.lr();
        let (train_loss, train_metrics) = train_epoch(session, &train_loader, epoch, learning_rate)?;
        let (val_loss, val_metrics) = evaluate_loader(&session.model, &session.loss, &val_loader, epoch)?;
        Ok(EpochResult { train_loss, train_metrics, val_loss, val_metrics, learning_rate })
    })
}

/// Evaluates the best weights of `session` on the test split.
pub fn evaluate_test(
    session: &TrainingSession,
    splits: &DatasetSplits,
) -> Result<(LossBreakdown, EvaluationMetrics)> {
    let (loss, metrics) = evaluate_records(session.best_model(), &session.loss, &splits.test, &session.config)?;
    info!(
        "Test: loss {:.4}, macro-F1 {:.4}, accuracy {:.4} over {} samples",
        loss.total, metrics.macro_f1, metrics.accuracy, metrics.samples
    );
    Ok((loss, metrics))
}

/// Mean batch loss and metrics of `model` over `records` with evaluation
/// preprocessing and no dropout.
pub fn evaluate_records(
    model: &SkinClassifier,
    loss: &CombinedLoss,
    records: &[ImageRecord],
    config: &TrainConfig,
) -> Result<(LossBreakdown, EvaluationMetrics)> {
    let pipeline = Pipeline::eval(config.image_size);
    let loader = BatchLoader::new(records, &pipeline, config.batch_size)
        .seed(config.seed)
        .workers(config.num_workers, config.prefetch);
    evaluate_loader(model, loss, &loader, 0)
}

// ---------------------------------------------------------------------------
// Epoch driver
// ---------------------------------------------------------------------------

/// Runs the epoch bookkeeping around `run_epoch`: scheduler stepping, best
/// tracking, checkpoint writes, progress emission and early stopping.
pub(crate) fn drive_epochs<F>(
    session: &mut TrainingSession,
    progress_tx: Option<&Sender<EpochStats>>,
    mut run_epoch: F,
) -> Result<TrainingOutcome>
where
    F: FnMut(&mut TrainingSession, usize) -> Result<EpochResult>,
{
    fs::create_dir_all(&session.config.checkpoint_dir)?;
    let mut stop_reason = StopReason::Completed;

    while session.epoch < session.config.epochs {
        let epoch = session.epoch + 1;
        let t_start = Instant::now();

        // ── One training pass plus validation ──────────────────────────────
        let result = run_epoch(session, epoch)?;
        session.scheduler.step();
        session.epoch = epoch;

        // ── Best tracking ─────────────────────────────────────────────────
        let val_f1 = result.val_metrics.macro_f1;
        let is_best = session.best_val_f1.map_or(true, |best| val_f1 > best);
        if is_best {
            session.best_val_f1 = Some(val_f1);
            session.best_epoch = Some(epoch);
            session.best_model = Some(session.model.clone());
        }

        let stats = EpochStats {
            epoch,
            total_epochs: session.config.epochs,
            train_loss: result.train_loss,
            val_loss: result.val_loss,
            train_macro_f1: result.train_metrics.macro_f1,
            val_macro_f1: val_f1,
            train_accuracy: result.train_metrics.accuracy,
            val_accuracy: result.val_metrics.accuracy,
            learning_rate: result.learning_rate,
            is_best,
            elapsed_ms: t_start.elapsed().as_millis() as u64,
        };
        info!(
            "Epoch {}/{}: train loss {:.4} (F1 {:.4}), val loss {:.4} (F1 {:.4}, acc {:.4}), lr {:.2e}{}",
            epoch,
            stats.total_epochs,
            stats.train_loss.total,
            stats.train_macro_f1,
            stats.val_loss.total,
            stats.val_macro_f1,
            stats.val_accuracy,
            stats.learning_rate,
            if is_best { " *" } else { "" }
        );
        session.history.record(stats.clone(), result.train_metrics, result.val_metrics);

        // ── Checkpoints ───────────────────────────────────────────────────
        if is_best || epoch % session.config.checkpoint_every == 0 {
            session.save_checkpoint(&epoch_checkpoint_file(epoch))?;
        }
        if is_best {
            let path = session.save_checkpoint(BEST_MODEL_FILE)?;
            info!("New best macro-F1 {:.4}, saved {}", val_f1, path.display());
        }

        // ── Emit progress ─────────────────────────────────────────────────
        if let Some(tx) = progress_tx {
            // If the receiver has been dropped, stop training.
            if tx.send(stats).is_err() {
                info!("Progress receiver closed; stopping after epoch {}", epoch);
                stop_reason = StopReason::ProgressClosed;
                break;
            }
        }

        if epoch > session.config.early_stop_after_epoch && val_f1 < session.config.early_stop_min_f1 {
            warn!(
                "Stopping early at epoch {}: validation macro-F1 {:.4} is below {}",
                epoch, val_f1, session.config.early_stop_min_f1
            );
            stop_reason = StopReason::EarlyStopped;
            break;
        }
    }

    let final_checkpoint = session.save_checkpoint(FINAL_MODEL_FILE)?;
    info!("Training finished after {} epochs ({:?})", session.epoch, stop_reason);
    Ok(TrainingOutcome {
        stop_reason,
        epochs_completed: session.epoch,
        best_val_f1: session.best_val_f1,
        best_epoch: session.best_epoch,
        final_checkpoint,
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// One full pass over the training loader. Returns the mean batch loss and
/// metrics of the (dropout-perturbed) training predictions.
fn train_epoch(
    session: &mut TrainingSession,
    loader: &BatchLoader<'_>,
    epoch: usize,
    learning_rate: f64,
) -> Result<(LossBreakdown, EvaluationMetrics)> {
    let mut total = LossBreakdown::default();
    let mut batches = 0usize;
    let mut metrics = MetricsAccumulator::new();

    loader.for_each_batch(epoch, |batch| {
        let loss = train_step(session, &batch, epoch, batches, learning_rate, &mut metrics)?;
        total.accumulate(&loss);
        batches += 1;
        Ok(())
    })?;

    Ok((total.scaled(1.0 / batches.max(1) as f64), metrics.compute()))
}

/// Forward, loss and backward for every sample of `batch`, then one clipped
/// AdamW update. Returns the batch loss.
pub(crate) fn train_step(
    session: &mut TrainingSession,
    batch: &Batch,
    epoch: usize,
    batch_no: usize,
    learning_rate: f64,
    metrics: &mut MetricsAccumulator,
) -> Result<LossBreakdown> {
    let seed = mix_seed(session.config.seed, &[DROPOUT_STREAM, epoch as u64, batch_no as u64]);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let norm = LossNormalizer::from_targets(&batch.presence_targets, &batch.severity_targets);

    let mut grads = session.model.zero_gradients();
    let mut total = LossBreakdown::default();
    let mut probabilities = Vec::with_capacity(batch.len());
    let mut logits = Vec::with_capacity(batch.len());

    for (i, image) in batch.images.iter().enumerate() {
        let trace = session.model.trace_with_dropout(image, &mut rng)?;
        let p = trace.presence_probabilities();
        let l = trace.severity_logits();
        let sample = session.loss.sample(
            &p, &l, &batch.presence_targets[i], &batch.severity_targets[i], &norm,
        )?;
        session.model.backward(&trace, &sample.presence_delta, &sample.severity_delta, &mut grads);
        total.accumulate(&sample.contribution);
        probabilities.push(p);
        logits.push(l);
    }

    let norm_before = clip_grad_norm(&mut grads, session.config.max_grad_norm);
    debug!("Epoch {} batch {}: loss {:.5}, grad norm {:.4}", epoch, batch_no, total.total, norm_before);
    session.optimizer.step(&mut session.model, &grads, learning_rate)?;

    metrics.update(&probabilities, &logits, &batch.presence_targets, &batch.severity_targets)?;
    Ok(total)
}

/// Mean batch loss and metrics without gradients.
fn evaluate_loader(
    model: &SkinClassifier,
    loss: &CombinedLoss,
    loader: &BatchLoader<'_>,
    epoch: usize,
) -> Result<(LossBreakdown, EvaluationMetrics)> {
    let mut total = LossBreakdown::default();
    let mut batches = 0usize;
    let mut metrics = MetricsAccumulator::new();

    loader.for_each_batch(epoch, |batch| {
        let out = model.forward(&batch.images)?;
        let batch_loss = loss.batch(
            &out.presence_probabilities,
            &out.severity_logits,
            &batch.presence_targets,
            &batch.severity_targets,
        )?;
        total.accumulate(&batch_loss);
        batches += 1;
        metrics.update(
            &out.presence_probabilities,
            &out.severity_logits,
            &batch.presence_targets,
            &batch.severity_targets,
        )
    })?;

    Ok((total.scaled(1.0 / batches.max(1) as f64), metrics.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{ConditionMap, IGNORE_INDEX};
    use crate::network::spec::Architecture;
    use crate::train::checkpoint::ModelCheckpoint;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path, epochs: usize) -> TrainConfig {
        TrainConfig {
            architecture: Architecture::GridPoolSmall,
            head_hidden: 4,
            epochs,
            batch_size: 2,
            image_size: 8,
            num_workers: 0,
            learning_rate: 1e-2,
            checkpoint_dir: dir.to_path_buf(),
            ..TrainConfig::default()
        }
    }

    fn metrics_with_f1(f1: f64) -> EvaluationMetrics {
        let mut m = MetricsAccumulator::new().compute();
        m.macro_f1 = f1;
        m
    }

    fn result(val_f1: f64) -> EpochResult {
        EpochResult {
            train_loss: LossBreakdown::default(),
            train_metrics: metrics_with_f1(0.0),
            val_loss: LossBreakdown::default(),
            val_metrics: metrics_with_f1(val_f1),
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn first_epoch_is_always_best() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 2)).unwrap();
        let outcome = drive_epochs(&mut session, None, |_, _| Ok(result(0.0))).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.best_epoch, Some(1));
        assert!(tmp.path().join(BEST_MODEL_FILE).exists());
        assert!(tmp.path().join(FINAL_MODEL_FILE).exists());
        assert!(tmp.path().join("checkpoint_epoch_1.json").exists());
        assert!(!tmp.path().join("checkpoint_epoch_2.json").exists());
    }

    #[test]
    fn stops_early_after_grace_period_with_best_persisted() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 50)).unwrap();
        let outcome = drive_epochs(&mut session, None, |_, epoch| {
            Ok(result(if epoch == 3 { 0.25 } else { 0.1 }))
        })
        .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
        assert_eq!(outcome.epochs_completed, 21);
        assert_eq!(outcome.best_epoch, Some(3));
        let best = ModelCheckpoint::load(&tmp.path().join(BEST_MODEL_FILE)).unwrap();
        assert_eq!(best.epoch, 3);
        assert_eq!(best.best_val_f1, Some(0.25));
        // Periodic checkpoints at 10 and 20 alongside the improvements.
        for n in [1, 3, 10, 20] {
            assert!(tmp.path().join(epoch_checkpoint_file(n)).exists(), "epoch {}", n);
        }
        assert!(!tmp.path().join(epoch_checkpoint_file(2)).exists());
        assert_eq!(session.history.epochs.len(), 21);
    }

    #[test]
    fn good_validation_f1_does_not_stop_early() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 22)).unwrap();
        let outcome = drive_epochs(&mut session, None, |_, _| Ok(result(0.5))).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.epochs_completed, 22);
    }

    #[test]
    fn dropped_receiver_stops_the_loop() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 5)).unwrap();
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let outcome = drive_epochs(&mut session, Some(&tx), |_, _| Ok(result(0.4))).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ProgressClosed);
        assert_eq!(outcome.epochs_completed, 1);
    }

    #[test]
    fn scheduler_steps_once_per_epoch() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 4)).unwrap();
        let (tx, rx) = mpsc::channel();
        drive_epochs(&mut session, Some(&tx), |s, _| {
            let mut r = result(0.5);
            r.learning_rate = s.scheduler.lr();
            Ok(r)
        })
        .unwrap();
        let rates: Vec<f64> = rx.try_iter().map(|s| s.learning_rate).collect();
        assert_eq!(rates.len(), 4);
        assert!(rates.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(session.scheduler.last_epoch(), 4);
    }

    #[test]
    fn train_step_updates_weights_on_all_negative_batch() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 1)).unwrap();
        let image = crate::data::tensor::ImageTensor::new(
            8, 8, (0..192).map(|i| (i % 13) as f64 / 13.0).collect(),
        )
        .unwrap();
        let batch = Batch {
            images: vec![image.clone(), image],
            presence_targets: vec![ConditionMap::from_fn(|_| 0.0); 2],
            severity_targets: vec![ConditionMap::from_fn(|_| IGNORE_INDEX); 2],
            paths: vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
        };
        let before = session.model.clone();
        let mut metrics = MetricsAccumulator::new();
        let loss = train_step(&mut session, &batch, 1, 0, 1e-2, &mut metrics).unwrap();

        assert!(loss.presence > 0.0);
        assert_eq!(loss.severity, 0.0);
        assert_ne!(session.model, before);
        assert_eq!(session.optimizer.steps(), 1);
        assert_eq!(metrics.compute().samples, 2);
    }

    #[test]
    fn empty_training_split_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut session = TrainingSession::new(config(tmp.path(), 1)).unwrap();
        let splits = DatasetSplits::default();
        assert!(matches!(train_loop(&mut session, &splits, None), Err(Error::Config(_))));
    }
}
