use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::data::tensor::{ImageTensor, CHANNELS};
use crate::error::{Error, Result};
use crate::layers::dense::{Init, Layer, LayerGradients, LayerTrace};
use crate::network::network::Network;
use crate::network::spec::{Architecture, ModelSpec};

/// Maps an image to a fixed-length feature vector.
///
/// Implementations expose their trainable layers so the optimizer and
/// gradient clipping can treat backbone and heads uniformly.
pub trait FeatureExtractor {
    /// Forward state kept for the backward pass.
    type Trace;

    fn feature_dim(&self) -> usize;

    fn forward(&self, image: &ImageTensor) -> Result<Self::Trace>;

    fn features(trace: &Self::Trace) -> &[f64];

    /// Accumulates parameter gradients given ∂L/∂features.
    fn backward(&self, trace: &Self::Trace, feature_grad: &[f64], grads: &mut [LayerGradients]);

    fn layers(&self) -> &[Layer];

    fn layers_mut(&mut self) -> &mut [Layer];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPoolBackbone {
    architecture: Architecture,
    projection: Network,
}

pub struct GridPoolTrace {
    pub pooled: Vec<f64>,
    pub layers: Vec<LayerTrace>,
}

impl GridPoolBackbone {
    pub fn new<R: Rng + ?Sized>(spec: &ModelSpec, rng: &mut R) -> GridPoolBackbone {
        GridPoolBackbone {
            architecture: spec.architecture,
            projection: Network::new(&spec.backbone_layers(), Init::He, rng),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn check_shapes(&self, spec: &ModelSpec) -> Result<()> {
        if self.architecture != spec.architecture {
            return Err(Error::Shape(format!(
                "backbone is {}, expected {}", self.architecture, spec.architecture
            )));
        }
        self.projection.check_shapes(&spec.backbone_layers())
    }
}

/// Mean and standard deviation of every channel over each cell of a
/// `grid × grid` partition, cell-major. Images smaller than the grid reuse
/// edge pixels so every cell is non-empty.
pub fn grid_pool(image: &ImageTensor, grid: usize) -> Result<Vec<f64>> {
    let (h, w) = (image.height(), image.width());
    if h == 0 || w == 0 || grid == 0 {
        return Err(Error::Shape(format!("cannot pool a {}×{} image on a {} grid", h, w, grid)));
    }
    let bounds = |cell: usize, extent: usize| {
        let start = (cell * extent / grid).min(extent - 1);
        let end = ((cell + 1) * extent / grid).clamp(start + 1, extent);
        (start, end)
    };

    let mut pooled = Vec::with_capacity(grid * grid * CHANNELS * 2);
    for gy in 0..grid {
        let (y0, y1) = bounds(gy, h);
        for gx in 0..grid {
            let (x0, x1) = bounds(gx, w);
            let n = ((y1 - y0) * (x1 - x0)) as f64;
            let mut sum = [0.0; CHANNELS];
            let mut sq = [0.0; CHANNELS];
            for y in y0..y1 {
                for x in x0..x1 {
                    for c in 0..CHANNELS {
                        let v = image.get(y, x, c);
                        sum[c] += v;
                        sq[c] += v * v;
                    }
                }
            }
            for c in 0..CHANNELS {
                let mean = sum[c] / n;
                let var = (sq[c] / n - mean * mean).max(0.0);
                pooled.push(mean);
                pooled.push(var.sqrt());
            }
        }
    }
    Ok(pooled)
}

impl FeatureExtractor for GridPoolBackbone {
    type Trace = GridPoolTrace;

    fn feature_dim(&self) -> usize {
        self.projection.output_size()
    }

    fn forward(&self, image: &ImageTensor) -> Result<GridPoolTrace> {
        let pooled = grid_pool(image, self.architecture.grid())?;
        let layers = self.projection.forward(&pooled)?;
        Ok(GridPoolTrace { pooled, layers })
    }

    fn features(trace: &GridPoolTrace) -> &[f64] {
        trace.layers.last().map(|t| t.output.as_slice()).unwrap_or(&trace.pooled)
    }

    fn backward(&self, trace: &GridPoolTrace, feature_grad: &[f64], grads: &mut [LayerGradients]) {
        let Some(last) = self.projection.layers.last() else { return };
        let Some(last_trace) = trace.layers.last() else { return };
        let pre_delta = last.activation_delta(last_trace, feature_grad);
        // Pooling is fixed; the gradient w.r.t. the pooled summary is dropped.
        self.projection.backward(&trace.layers, pre_delta, grads);
    }

    fn layers(&self) -> &[Layer] {
        &self.projection.layers
    }

    fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.projection.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn pooled_summary_has_fixed_length() {
        let img = ImageTensor::new(10, 7, (0..210).map(|v| v as f64).collect()).unwrap();
        assert_eq!(grid_pool(&img, 4).unwrap().len(), 4 * 4 * 6);
        // Smaller than the grid still works.
        let tiny = ImageTensor::new(2, 2, vec![1.0; 12]).unwrap();
        assert_eq!(grid_pool(&tiny, 4).unwrap().len(), 96);
    }

    #[test]
    fn constant_image_pools_to_mean_and_zero_std() {
        let img = ImageTensor::new(8, 8, vec![0.5; 192]).unwrap();
        let pooled = grid_pool(&img, 2).unwrap();
        for pair in pooled.chunks(2) {
            assert_abs_diff_eq!(pair[0], 0.5, epsilon = 1e-12);
            assert_abs_diff_eq!(pair[1], 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn features_have_architecture_dimension() {
        let spec = ModelSpec { architecture: Architecture::GridPoolSmall, ..ModelSpec::default() };
        let backbone = GridPoolBackbone::new(&spec, &mut ChaCha8Rng::seed_from_u64(0));
        let img = ImageTensor::new(8, 8, (0..192).map(|v| (v % 7) as f64 / 7.0).collect()).unwrap();
        let trace = backbone.forward(&img).unwrap();
        assert_eq!(GridPoolBackbone::features(&trace).len(), 64);
        assert_eq!(backbone.feature_dim(), 64);
        assert!(backbone.check_shapes(&spec).is_ok());
        assert!(backbone.check_shapes(&ModelSpec::default()).is_err());
    }

    #[test]
    fn empty_image_is_a_shape_error() {
        assert!(matches!(grid_pool(&ImageTensor::zeros(0, 0), 2), Err(Error::Shape(_))));
    }
}
