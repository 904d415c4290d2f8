use rand::Rng;

/// Inverted dropout mask: each unit is kept with probability `1 - rate` and
/// scaled by `1 / (1 - rate)`, so evaluation needs no rescaling.
#[derive(Debug, Clone, PartialEq)]
pub struct DropoutMask {
    scales: Vec<f64>,
}

impl DropoutMask {
    pub fn sample<R: Rng + ?Sized>(len: usize, rate: f64, rng: &mut R) -> DropoutMask {
        if rate <= 0.0 {
            return DropoutMask::identity(len);
        }
        let keep = 1.0 - rate.min(1.0);
        let scale = if keep > 0.0 { 1.0 / keep } else { 0.0 };
        let scales = (0..len)
            .map(|_| if rng.gen::<f64>() < keep { scale } else { 0.0 })
            .collect();
        DropoutMask { scales }
    }

    pub fn identity(len: usize) -> DropoutMask {
        DropoutMask { scales: vec![1.0; len] }
    }

    /// Masks activations on the way forward, or gradients on the way back.
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        values.iter().zip(self.scales.iter()).map(|(v, s)| v * s).collect()
    }
}
