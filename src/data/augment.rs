use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::tensor::{ImageTensor, CHANNELS};
use crate::error::Result;
use crate::math::standard_normal;

pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

const PIXEL_MAX: f64 = 255.0;

/// One named image transform. Random transforms carry the probability `p`
/// with which they fire; resize and normalize always run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Resize { height: usize, width: usize },
    HorizontalFlip { p: f64 },
    /// Rotation by a random multiple of 90 degrees (including zero).
    RandomRotate90 { p: f64 },
    /// Affine jitter about the image centre. Shift is a fraction of the side
    /// length, scale a fractional zoom, rotation in degrees.
    ShiftScaleRotate { shift_limit: f64, scale_limit: f64, rotate_limit: f64, p: f64 },
    RandomBrightnessContrast { brightness_limit: f64, contrast_limit: f64, p: f64 },
    /// Hue in degrees; saturation and value on the 0–255 scale.
    HueSaturationValue { hue_shift_limit: f64, sat_shift_limit: f64, val_shift_limit: f64, p: f64 },
    /// Additive noise with a variance drawn from `[var_min, var_max]` (0–255 scale).
    GaussianNoise { var_min: f64, var_max: f64, p: f64 },
    Normalize { mean: [f64; 3], std: [f64; 3] },
}

impl Transform {
    fn probability(&self) -> f64 {
        match self {
            Transform::Resize { .. } | Transform::Normalize { .. } => 1.0,
            Transform::HorizontalFlip { p }
            | Transform::RandomRotate90 { p }
            | Transform::ShiftScaleRotate { p, .. }
            | Transform::RandomBrightnessContrast { p, .. }
            | Transform::HueSaturationValue { p, .. }
            | Transform::GaussianNoise { p, .. } => *p,
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: ImageTensor, rng: &mut R) -> Result<ImageTensor> {
        let p = self.probability();
        if p < 1.0 && rng.gen::<f64>() >= p {
            return Ok(img);
        }
        match *self {
            Transform::Resize { height, width } => img.resize(height, width),
            Transform::HorizontalFlip { .. } => Ok(horizontal_flip(&img)),
            Transform::RandomRotate90 { .. } => {
                let turns = rng.gen_range(0..4);
                Ok(rotate90(img, turns))
            }
            Transform::ShiftScaleRotate { shift_limit, scale_limit, rotate_limit, .. } => {
                let dx = symmetric(rng, shift_limit);
                let dy = symmetric(rng, shift_limit);
                let scale = 1.0 + symmetric(rng, scale_limit);
                let angle = symmetric(rng, rotate_limit);
                Ok(affine(&img, dx, dy, scale, angle))
            }
            Transform::RandomBrightnessContrast { brightness_limit, contrast_limit, .. } => {
                let alpha = 1.0 + symmetric(rng, contrast_limit);
                let beta = symmetric(rng, brightness_limit) * PIXEL_MAX;
                let mut img = img;
                for v in img.data_mut() {
                    *v = (*v * alpha + beta).clamp(0.0, PIXEL_MAX);
                }
                Ok(img)
            }
            Transform::HueSaturationValue { hue_shift_limit, sat_shift_limit, val_shift_limit, .. } => {
                let dh = symmetric(rng, hue_shift_limit);
                let ds = symmetric(rng, sat_shift_limit);
                let dv = symmetric(rng, val_shift_limit);
                let mut img = img;
                for px in img.data_mut().chunks_exact_mut(CHANNELS) {
                    let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
                    let h = (h + dh).rem_euclid(360.0);
                    let s = (s + ds).clamp(0.0, PIXEL_MAX);
                    let v = (v + dv).clamp(0.0, PIXEL_MAX);
                    let (r, g, b) = hsv_to_rgb(h, s, v);
                    px[0] = r;
                    px[1] = g;
                    px[2] = b;
                }
                Ok(img)
            }
            Transform::GaussianNoise { var_min, var_max, .. } => {
                let var = if var_max > var_min { rng.gen_range(var_min..=var_max) } else { var_min };
                let sigma = var.max(0.0).sqrt();
                let mut img = img;
                for v in img.data_mut() {
                    *v = (*v + standard_normal(rng) * sigma).clamp(0.0, PIXEL_MAX);
                }
                Ok(img)
            }
            Transform::Normalize { mean, std } => {
                let mut img = img;
                for px in img.data_mut().chunks_exact_mut(CHANNELS) {
                    for c in 0..CHANNELS {
                        px[c] = (px[c] / PIXEL_MAX - mean[c]) / std[c];
                    }
                }
                Ok(img)
            }
        }
    }
}

/// An ordered transform list applied to every sample of a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub transforms: Vec<Transform>,
}

impl Pipeline {
    pub fn new(transforms: Vec<Transform>) -> Pipeline {
        Pipeline { transforms }
    }

    /// Training augmentation: geometric and photometric jitter.
    pub fn train(image_size: usize) -> Pipeline {
        Pipeline::new(vec![
            Transform::Resize { height: image_size, width: image_size },
            Transform::HorizontalFlip { p: 0.5 },
            Transform::RandomRotate90 { p: 0.3 },
            Transform::ShiftScaleRotate { shift_limit: 0.1, scale_limit: 0.1, rotate_limit: 15.0, p: 0.5 },
            Transform::RandomBrightnessContrast { brightness_limit: 0.2, contrast_limit: 0.2, p: 0.5 },
            Transform::HueSaturationValue {
                hue_shift_limit: 20.0,
                sat_shift_limit: 30.0,
                val_shift_limit: 20.0,
                p: 0.5,
            },
            Transform::GaussianNoise { var_min: 10.0, var_max: 50.0, p: 0.3 },
            Transform::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD },
        ])
    }

    /// Validation, test and inference preprocessing.
    pub fn eval(image_size: usize) -> Pipeline {
        Pipeline::new(vec![
            Transform::Resize { height: image_size, width: image_size },
            Transform::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD },
        ])
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: ImageTensor, rng: &mut R) -> Result<ImageTensor> {
        self.transforms.iter().try_fold(img, |img, t| t.apply(img, rng))
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, limit: f64) -> f64 {
    if limit > 0.0 { rng.gen_range(-limit..=limit) } else { 0.0 }
}

fn horizontal_flip(img: &ImageTensor) -> ImageTensor {
    let (h, w) = (img.height(), img.width());
    let mut out = ImageTensor::zeros(h, w);
    for y in 0..h {
        for x in 0..w {
            let src = img.index(y, w - 1 - x, 0);
            let dst = out.index(y, x, 0);
            out.data_mut()[dst..dst + CHANNELS].copy_from_slice(&img.data()[src..src + CHANNELS]);
        }
    }
    out
}

/// Rotates counter-clockwise by `turns` quarter turns.
fn rotate90(img: ImageTensor, turns: u32) -> ImageTensor {
    let mut img = img;
    for _ in 0..turns % 4 {
        let (h, w) = (img.height(), img.width());
        let mut out = ImageTensor::zeros(w, h);
        for y in 0..h {
            for x in 0..w {
                let src = img.index(y, x, 0);
                let dst = out.index(w - 1 - x, y, 0);
                out.data_mut()[dst..dst + CHANNELS].copy_from_slice(&img.data()[src..src + CHANNELS]);
            }
        }
        img = out;
    }
    img
}

/// Index reflection without repeating the edge pixel (`dcba|abcd|dcba` → `dcb|abcd|cba`).
fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let i = i.rem_euclid(period);
    if i >= n as isize { (period - i) as usize } else { i as usize }
}

/// Inverse-mapped affine warp about the centre with bilinear sampling.
fn affine(img: &ImageTensor, dx: f64, dy: f64, scale: f64, angle_deg: f64) -> ImageTensor {
    let (h, w) = (img.height(), img.width());
    let mut out = ImageTensor::zeros(h, w);
    let (cx, cy) = ((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let scale = if scale.abs() < 1e-6 { 1e-6 } else { scale };

    for y in 0..h {
        for x in 0..w {
            let u = x as f64 - cx - dx * w as f64;
            let v = y as f64 - cy - dy * h as f64;
            let sx = (cos * u - sin * v) / scale + cx;
            let sy = (sin * u + cos * v) / scale + cy;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let fx = sx - x0;
            let fy = sy - y0;
            let xs = [reflect101(x0 as isize, w), reflect101(x0 as isize + 1, w)];
            let ys = [reflect101(y0 as isize, h), reflect101(y0 as isize + 1, h)];

            let dst = out.index(y, x, 0);
            for c in 0..CHANNELS {
                let top = img.get(ys[0], xs[0], c) * (1.0 - fx) + img.get(ys[0], xs[1], c) * fx;
                let bottom = img.get(ys[1], xs[0], c) * (1.0 - fx) + img.get(ys[1], xs[1], c) * fx;
                out.data_mut()[dst + c] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

/// RGB (0–255) to HSV with hue in degrees and S, V on 0–255.
fn rgb_to_hsv(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max * PIXEL_MAX };
    (h, s, max)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    let s = s / PIXEL_MAX;
    let c = v * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    (r + m, g + m, b + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn numbered(h: usize, w: usize) -> ImageTensor {
        let data = (0..h * w * CHANNELS).map(|i| (i / CHANNELS) as f64).collect();
        ImageTensor::new(h, w, data).unwrap()
    }

    #[test]
    fn train_and_eval_pipelines_produce_square_tensors() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let img = numbered(20, 30);
        for _ in 0..5 {
            let out = Pipeline::train(16).apply(img.clone(), &mut rng).unwrap();
            assert_eq!(out.shape(), (16, 16, 3));
            assert!(out.data().iter().all(|v| v.is_finite()));
        }
        let out = Pipeline::eval(8).apply(img, &mut rng).unwrap();
        assert_eq!(out.shape(), (8, 8, 3));
    }

    #[test]
    fn eval_pipeline_is_deterministic() {
        let img = numbered(12, 12);
        let a = Pipeline::eval(6).apply(img.clone(), &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        let b = Pipeline::eval(6).apply(img, &mut ChaCha8Rng::seed_from_u64(99)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_uses_imagenet_statistics() {
        let img = ImageTensor::new(1, 1, vec![255.0, 0.0, 127.5]).unwrap();
        let t = Transform::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD };
        let out = t.apply(img, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_abs_diff_eq!(out.data()[0], (1.0 - 0.485) / 0.229, epsilon = 1e-12);
        assert_abs_diff_eq!(out.data()[1], -0.456 / 0.224, epsilon = 1e-12);
    }

    fn channel_bounds(c: usize) -> (f64, f64) {
        (-IMAGENET_MEAN[c] / IMAGENET_STD[c], (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
    }

    /// Smooth diagonal ramp, shifted by `offset` and capped at white.
    fn patterned(h: usize, w: usize, offset: usize) -> ImageTensor {
        let mut img = ImageTensor::zeros(h, w);
        for y in 0..h {
            for x in 0..w {
                for c in 0..CHANNELS {
                    let i = img.index(y, x, c);
                    img.data_mut()[i] = (x * 10 + y * 2 + c * 15 + offset).min(255) as f64;
                }
            }
        }
        img
    }

    #[test]
    fn dark_and_bright_images_stay_distinct_after_resize() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let pipeline = Pipeline::eval(8);
        let dark = pipeline.apply(ImageTensor::new(20, 20, vec![50.0; 1200]).unwrap(), &mut rng).unwrap();
        let bright = pipeline.apply(ImageTensor::new(20, 20, vec![200.0; 1200]).unwrap(), &mut rng).unwrap();
        assert_ne!(dark, bright);
        assert_abs_diff_eq!(dark.get(3, 3, 0), (50.0 / 255.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0], epsilon = 1e-9);
        assert_abs_diff_eq!(bright.get(3, 3, 2), (200.0 / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2], epsilon = 1e-9);

        let a = pipeline.apply(patterned(20, 20, 0), &mut rng).unwrap();
        let b = pipeline.apply(patterned(20, 20, 90), &mut rng).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn normalized_values_span_the_imagenet_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for pipeline in [Pipeline::eval(8), Pipeline::train(8)] {
            for seed in 0..5 {
                let out = pipeline.apply(patterned(20, 20, seed), &mut rng).unwrap();
                let mut lo = f64::MAX;
                let mut hi = f64::MIN;
                for px in out.data().chunks_exact(CHANNELS) {
                    for c in 0..CHANNELS {
                        let (min, max) = channel_bounds(c);
                        assert!(px[c] >= min - 1e-6 && px[c] <= max + 1e-6, "channel {} value {}", c, px[c]);
                        lo = lo.min(px[c]);
                        hi = hi.max(px[c]);
                    }
                }
                // A varied image must not collapse to a near-constant tensor.
                assert!(hi - lo > 0.5, "spread {}", hi - lo);
            }
        }
    }

    #[test]
    fn flip_mirrors_columns() {
        let out = horizontal_flip(&numbered(2, 3));
        assert_eq!(out.get(0, 0, 0), 2.0);
        assert_eq!(out.get(1, 2, 0), 3.0);
    }

    #[test]
    fn four_quarter_turns_are_identity() {
        let img = numbered(3, 5);
        let once = rotate90(img.clone(), 1);
        assert_eq!(once.shape(), (5, 3, 3));
        assert_eq!(rotate90(img.clone(), 4), img);
    }

    #[test]
    fn identity_affine_preserves_image() {
        let img = numbered(6, 6);
        let out = affine(&img, 0.0, 0.0, 1.0, 0.0);
        for (a, b) in out.data().iter().zip(img.data()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn reflect101_does_not_repeat_edges() {
        assert_eq!(reflect101(-1, 4), 1);
        assert_eq!(reflect101(4, 4), 2);
        assert_eq!(reflect101(2, 4), 2);
        assert_eq!(reflect101(-3, 1), 0);
    }

    #[test]
    fn hsv_round_trip() {
        for &(r, g, b) in &[(255.0, 0.0, 0.0), (10.0, 200.0, 90.0), (40.0, 40.0, 40.0), (12.0, 34.0, 250.0)] {
            let (h, s, v) = rgb_to_hsv(r, g, b);
            let (r2, g2, b2) = hsv_to_rgb(h, s, v);
            assert_abs_diff_eq!(r, r2, epsilon = 1e-9);
            assert_abs_diff_eq!(g, g2, epsilon = 1e-9);
            assert_abs_diff_eq!(b, b2, epsilon = 1e-9);
        }
    }

    #[test]
    fn photometric_jitter_stays_in_pixel_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let img = numbered(4, 4);
        let noise = Transform::GaussianNoise { var_min: 10.0, var_max: 50.0, p: 1.0 };
        let bc = Transform::RandomBrightnessContrast { brightness_limit: 0.2, contrast_limit: 0.2, p: 1.0 };
        let out = bc.apply(noise.apply(img, &mut rng).unwrap(), &mut rng).unwrap();
        assert!(out.data().iter().all(|&v| (0.0..=255.0).contains(&v)));
    }

    #[test]
    fn pipeline_serializes_as_tagged_list() {
        let json = serde_json::to_value(Pipeline::eval(224)).unwrap();
        assert_eq!(json["transforms"][0]["type"], "resize");
        assert_eq!(json["transforms"][1]["type"], "normalize");
    }
}
