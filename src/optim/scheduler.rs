use std::f64::consts::PI;

use serde::{Serialize, Deserialize};

/// Cosine annealing from `base_lr` down to `eta_min` over `t_max` epochs.
/// Past `t_max` the rate stays at `eta_min`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealing {
    pub base_lr: f64,
    pub eta_min: f64,
    pub t_max: usize,
    last_epoch: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, eta_min: f64, t_max: usize) -> CosineAnnealing {
        CosineAnnealing { base_lr, eta_min, t_max, last_epoch: 0 }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.t_max == 0 || epoch >= self.t_max {
            return self.eta_min;
        }
        let progress = epoch as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }

    /// Rate for the current epoch.
    pub fn lr(&self) -> f64 {
        self.lr_at(self.last_epoch)
    }

    /// Completed scheduler steps.
    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    /// Advances one epoch and returns the new rate.
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn anneals_from_base_to_floor() {
        let mut s = CosineAnnealing::new(1e-4, 1e-6, 10);
        assert_abs_diff_eq!(s.lr(), 1e-4, epsilon = 1e-15);
        for _ in 0..5 {
            s.step();
        }
        assert_abs_diff_eq!(s.lr(), (1e-4 + 1e-6) / 2.0, epsilon = 1e-15);
        for _ in 0..5 {
            s.step();
        }
        assert_abs_diff_eq!(s.lr(), 1e-6, epsilon = 1e-15);
        s.step();
        assert_abs_diff_eq!(s.lr(), 1e-6, epsilon = 1e-15);
        assert_eq!(s.last_epoch(), 11);
    }

    #[test]
    fn rate_never_increases() {
        let s = CosineAnnealing::new(0.1, 0.0, 20);
        for e in 0..25 {
            assert!(s.lr_at(e + 1) <= s.lr_at(e));
        }
    }
}
