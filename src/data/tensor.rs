use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb32FImage, RgbImage};

use crate::error::{Error, Result};

pub const CHANNELS: usize = 3;

/// An RGB image as `height × width × 3` floats in HWC order.
///
/// Before normalization values live on the 0–255 pixel scale so that
/// augmentation parameters read the same as for 8-bit images.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    height: usize,
    width: usize,
    data: Vec<f64>,
}

impl ImageTensor {
    pub fn new(height: usize, width: usize, data: Vec<f64>) -> Result<ImageTensor> {
        if data.len() != height * width * CHANNELS {
            return Err(Error::Shape(format!(
                "expected {}×{}×{} = {} values, got {}",
                height, width, CHANNELS, height * width * CHANNELS, data.len()
            )));
        }
        Ok(ImageTensor { height, width, data })
    }

    pub fn zeros(height: usize, width: usize) -> ImageTensor {
        ImageTensor { height, width, data: vec![0.0; height * width * CHANNELS] }
    }

    pub fn from_rgb(img: &RgbImage) -> ImageTensor {
        let (width, height) = img.dimensions();
        let data = img.pixels().flat_map(|p| p.0.iter().map(|&c| c as f64)).collect();
        ImageTensor { height: height as usize, width: width as usize, data }
    }

    /// Decodes an image file from disk.
    pub fn open(path: &Path) -> Result<ImageTensor> {
        let img = image::open(path)
            .map_err(|e| Error::Image(format!("{}: {}", path.display(), e)))?;
        Ok(ImageTensor::from_rgb(&img.to_rgb8()))
    }

    /// Decodes encoded image bytes (PNG, JPEG, ...).
    pub fn decode(bytes: &[u8]) -> Result<ImageTensor> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidInput(format!("cannot decode image: {}", e)))?;
        Ok(ImageTensor::from_rgb(&img.to_rgb8()))
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, CHANNELS)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[inline]
    pub fn index(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.width + x) * CHANNELS + c
    }

    #[inline]
    pub fn get(&self, y: usize, x: usize, c: usize) -> f64 {
        self.data[self.index(y, x, c)]
    }

    /// Bilinear resize to `height × width` without quantizing to 8 bits.
    ///
    /// `Rgb32FImage` clamps to `[0, 1]`, so values are mapped onto that
    /// interval from the tensor's own range and mapped back afterwards.
    pub fn resize(&self, height: usize, width: usize) -> Result<ImageTensor> {
        if height == 0 || width == 0 {
            return Err(Error::Shape(format!("cannot resize to {}×{}", height, width)));
        }
        if height == self.height && width == self.width {
            return Ok(self.clone());
        }
        if self.height == 0 || self.width == 0 {
            return Err(Error::Shape("cannot resize an empty image".to_string()));
        }
        let lo = self.data.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = hi - lo;
        if !(span > 0.0) {
            return Ok(ImageTensor { height, width, data: vec![lo; height * width * CHANNELS] });
        }
        let src = Rgb32FImage::from_raw(
            self.width as u32,
            self.height as u32,
            self.data.iter().map(|&v| ((v - lo) / span) as f32).collect(),
        )
        .ok_or_else(|| Error::Shape("tensor does not form an image buffer".to_string()))?;
        let out = imageops::resize(&src, width as u32, height as u32, FilterType::Triangle);
        let data = out.into_raw().into_iter().map(|v| lo + v as f64 * span).collect();
        ImageTensor::new(height, width, data)
    }

    /// Copies the `[y0, y0 + h) × [x0, x0 + w)` window, clipped to the image.
    pub fn crop(&self, y0: usize, x0: usize, h: usize, w: usize) -> ImageTensor {
        let y1 = (y0 + h).min(self.height);
        let x1 = (x0 + w).min(self.width);
        let y0 = y0.min(y1);
        let x0 = x0.min(x1);
        let mut data = Vec::with_capacity((y1 - y0) * (x1 - x0) * CHANNELS);
        for y in y0..y1 {
            let start = self.index(y, x0, 0);
            data.extend_from_slice(&self.data[start..start + (x1 - x0) * CHANNELS]);
        }
        ImageTensor { height: y1 - y0, width: x1 - x0, data }
    }
}
