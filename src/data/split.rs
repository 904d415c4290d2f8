use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::labels::ImageRecord;

/// Train and validation shares; the test share is the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitFractions {
    pub train: f64,
    pub val: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        SplitFractions { train: 0.7, val: 0.15 }
    }
}

impl SplitFractions {
    pub fn test(&self) -> f64 {
        (1.0 - self.train - self.val).max(0.0)
    }

    pub fn validate(&self) -> Result<()> {
        let ok = self.train > 0.0
            && self.train <= 1.0
            && self.val >= 0.0
            && self.train + self.val <= 1.0 + 1e-9;
        if ok {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "invalid split fractions: train {} / val {} / test {}",
                self.train, self.val, 1.0 - self.train - self.val
            )))
        }
    }
}

/// Disjoint train / validation / test partitions of one record list.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplits {
    pub train: Vec<ImageRecord>,
    pub val: Vec<ImageRecord>,
    pub test: Vec<ImageRecord>,
}

impl DatasetSplits {
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.train.len(), self.val.len(), self.test.len())
    }
}

/// Shuffles with a seeded generator and cuts the records into three parts.
///
/// The held-out part (val + test) gets `ceil(n * (1 - train))` samples and
/// is then halved the same way, so small corpora round in favour of held-out
/// data: 21 records give 14 / 3 / 4. No stratification is attempted.
pub fn split_records(
    records: Vec<ImageRecord>,
    fractions: SplitFractions,
    seed: u64,
) -> Result<DatasetSplits> {
    fractions.validate()?;
    let n = records.len();
    if n == 0 {
        return Ok(DatasetSplits::default());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);

    let held_out = held_out_count(n, 1.0 - fractions.train);
    if held_out >= n {
        return Err(Error::Config(format!(
            "train fraction {} leaves no training samples out of {}",
            fractions.train, n
        )));
    }
    let (train_idx, rest) = order.split_at(n - held_out);

    let mut rest = rest.to_vec();
    rest.shuffle(&mut rng);
    let holdout_share = fractions.val + fractions.test();
    let test_count = if holdout_share > 0.0 {
        held_out_count(rest.len(), fractions.test() / holdout_share)
    } else {
        0
    };
    let (val_idx, test_idx) = rest.split_at(rest.len() - test_count.min(rest.len()));

    let mut slots: Vec<Option<ImageRecord>> = records.into_iter().map(Some).collect();
    let mut take = |idx: &[usize]| -> Vec<ImageRecord> {
        idx.iter().filter_map(|&i| slots[i].take()).collect()
    };
    let train = take(train_idx);
    let val = take(val_idx);
    let test = take(test_idx);

    Ok(DatasetSplits { train, val, test })
}

/// `ceil(n * fraction)`, tolerant of representation error such as
/// `20 * 0.3 = 6.000000000000001`.
fn held_out_count(n: usize, fraction: f64) -> usize {
    if fraction <= 0.0 {
        return 0;
    }
    ((n as f64 * fraction - 1e-9).ceil().max(0.0) as usize).min(n)
}
