use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{mpsc, Condvar, Mutex};
use std::thread;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::data::augment::Pipeline;
use crate::data::tensor::ImageTensor;
use crate::error::{Error, Result};
use crate::labels::{ConditionMap, ImageRecord};
use crate::math::mix_seed;

/// A mini-batch of preprocessed samples with their targets, in matching order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub images: Vec<ImageTensor>,
    /// 1.0 / 0.0 per condition.
    pub presence_targets: Vec<ConditionMap<f64>>,
    /// Class index within the condition's vocabulary, or `IGNORE_INDEX`.
    pub severity_targets: Vec<ConditionMap<i64>>,
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Streams batches of decoded and transformed records.
///
/// With `num_workers > 0`, samples are prepared on scoped worker threads and
/// handed over through a bounded channel of `prefetch` batches; batches are
/// still delivered in order. Every batch draws its augmentation randomness
/// from a generator seeded by `(seed, epoch, batch index)`, so a given epoch
/// produces identical tensors regardless of thread scheduling.
pub struct BatchLoader<'a> {
    records: &'a [ImageRecord],
    pipeline: &'a Pipeline,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    num_workers: usize,
    prefetch: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(records: &'a [ImageRecord], pipeline: &'a Pipeline, batch_size: usize) -> BatchLoader<'a> {
        BatchLoader {
            records,
            pipeline,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
            num_workers: 0,
            prefetch: 1,
        }
    }

    /// Reshuffles the sample order every epoch.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn workers(mut self, num_workers: usize, prefetch: usize) -> Self {
        self.num_workers = num_workers;
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.records.len().div_ceil(self.batch_size)
    }

    fn batch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, &[epoch as u64]));
            order.shuffle(&mut rng);
        }
        order.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    fn build_batch(&self, epoch: usize, batch_no: usize, indices: &[usize]) -> Result<Batch> {
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, &[epoch as u64, batch_no as u64]));
        let mut batch = Batch::default();
        for &i in indices {
            let record = &self.records[i];
            let image = ImageTensor::open(record.image_path())?;
            batch.images.push(self.pipeline.apply(image, &mut rng)?);
            batch.presence_targets.push(record.presence_targets());
            batch.severity_targets.push(record.severity_targets());
            batch.paths.push(record.image_path().clone());
        }
        Ok(batch)
    }

    /// Runs `f` on every batch of `epoch`, in order, stopping at the first error.
    pub fn for_each_batch<F>(&self, epoch: usize, mut f: F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let plan = self.batch_indices(epoch);
        if self.num_workers == 0 || plan.len() <= 1 {
            for (batch_no, indices) in plan.iter().enumerate() {
                f(self.build_batch(epoch, batch_no, indices)?)?;
            }
            return Ok(());
        }

        let workers = self.num_workers.min(plan.len());
        debug!("Loading {} batches on {} workers", plan.len(), workers);
        let gate = ClaimGate::new(plan.len(), self.prefetch);

        thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<(usize, Result<Batch>)>(self.prefetch);
            for _ in 0..workers {
                let tx = tx.clone();
                let (plan, gate) = (&plan, &gate);
                scope.spawn(move || {
                    while let Some(batch_no) = gate.claim() {
                        let batch = self.build_batch(epoch, batch_no, &plan[batch_no]);
                        if tx.send((batch_no, batch)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            let result = deliver_in_order(rx, &gate, &mut f);
            // Wakes waiting workers; no further batches are started.
            gate.close();
            result
        })
    }
}

/// Hands out batch numbers at most `window` ahead of the next batch to be
/// delivered, which bounds the out-of-order backlog to `window` batches.
struct ClaimGate {
    /// (next batch to claim, batches delivered so far)
    state: Mutex<(usize, usize)>,
    ready: Condvar,
    total: usize,
    window: usize,
}

impl ClaimGate {
    fn new(total: usize, window: usize) -> ClaimGate {
        ClaimGate { state: Mutex::new((0, 0)), ready: Condvar::new(), total, window: window.max(1) }
    }

    /// Blocks until a batch may be claimed; `None` once all are claimed.
    fn claim(&self) -> Option<usize> {
        let mut state = self.state.lock().ok()?;
        loop {
            let (next, delivered) = *state;
            if next >= self.total {
                return None;
            }
            if next < delivered + self.window {
                state.0 += 1;
                return Some(next);
            }
            state = self.ready.wait(state).ok()?;
        }
    }

    fn delivered(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.1 = count;
        }
        self.ready.notify_all();
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.0 = self.total;
        }
        self.ready.notify_all();
    }
}

fn deliver_in_order<F>(rx: mpsc::Receiver<(usize, Result<Batch>)>, gate: &ClaimGate, f: &mut F) -> Result<()>
where
    F: FnMut(Batch) -> Result<()>,
{
    let mut pending: BTreeMap<usize, Batch> = BTreeMap::new();
    let mut expected = 0;
    while expected < gate.total {
        if let Some(batch) = pending.remove(&expected) {
            f(batch)?;
            expected += 1;
            gate.delivered(expected);
            continue;
        }
        let (batch_no, batch) = rx
            .recv()
            .map_err(|_| Error::Corpus("batch workers exited early".to_string()))?;
        pending.insert(batch_no, batch?);
    }
    Ok(())
}
