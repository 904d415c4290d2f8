use std::fmt;

use serde::{Serialize, Deserialize};

use crate::data::tensor::{ImageTensor, CHANNELS};
use crate::error::{Error, Result};

/// Face sub-regions analysed separately when region analysis is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceRegion {
    LeftCheek,
    RightCheek,
    Forehead,
    TZone,
    Chin,
}

impl FaceRegion {
    pub const ALL: [FaceRegion; 5] = [
        FaceRegion::LeftCheek,
        FaceRegion::RightCheek,
        FaceRegion::Forehead,
        FaceRegion::TZone,
        FaceRegion::Chin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaceRegion::LeftCheek  => "left_cheek",
            FaceRegion::RightCheek => "right_cheek",
            FaceRegion::Forehead   => "forehead",
            FaceRegion::TZone      => "t_zone",
            FaceRegion::Chin       => "chin",
        }
    }

    /// Outline of the region as indices into a 468-point face mesh.
    pub fn mesh_indices(self) -> &'static [usize] {
        match self {
            FaceRegion::LeftCheek  => &[234, 93, 137, 177, 215, 227, 234],
            FaceRegion::RightCheek => &[454, 323, 361, 401, 429, 447, 454],
            FaceRegion::Forehead   => &[10, 338, 297, 332, 284, 251, 389, 356, 454, 234, 127, 162, 10],
            FaceRegion::TZone      => &[168, 6, 197, 195, 5, 4, 45, 275, 4, 195, 197, 6, 168],
            FaceRegion::Chin       => &[152, 377, 400, 379, 365, 397, 365, 379, 400, 377, 152],
        }
    }
}

impl fmt::Display for FaceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A face-mesh landmark in normalized image coordinates (0..1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
}

/// A polygon in pixel coordinates, `(x, y)` per vertex.
pub type Polygon = Vec<(f64, f64)>;

/// Produces face landmarks for an image.
///
/// `Ok(None)` means no face was found; an `Err` means the detector itself
/// failed. Either way the caller skips region analysis.
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, image: &ImageTensor) -> Result<Option<Vec<Landmark>>>;
}

/// Finds region polygons on an image.
pub trait RegionLocator: Send + Sync {
    fn locate(&self, image: &ImageTensor) -> Result<Option<Vec<(FaceRegion, Polygon)>>>;
}

/// Turns mesh landmarks from any detector into region polygons.
pub struct LandmarkRegionLocator<D> {
    detector: D,
}

impl<D: LandmarkDetector> LandmarkRegionLocator<D> {
    pub fn new(detector: D) -> Self {
        LandmarkRegionLocator { detector }
    }
}

impl<D: LandmarkDetector> RegionLocator for LandmarkRegionLocator<D> {
    fn locate(&self, image: &ImageTensor) -> Result<Option<Vec<(FaceRegion, Polygon)>>> {
        let Some(landmarks) = self.detector.detect(image)? else {
            return Ok(None);
        };
        let (w, h) = (image.width() as f64, image.height() as f64);
        let mut regions = Vec::with_capacity(FaceRegion::ALL.len());
        for region in FaceRegion::ALL {
            let polygon = region
                .mesh_indices()
                .iter()
                .map(|&i| {
                    landmarks
                        .get(i)
                        .map(|lm| ((lm.x * w).trunc(), (lm.y * h).trunc()))
                        .ok_or_else(|| Error::RegionDetection(format!(
                            "{} needs landmark {} but only {} were detected", region, i, landmarks.len()
                        )))
                })
                .collect::<Result<Polygon>>()?;
            regions.push((region, polygon));
        }
        Ok(Some(regions))
    }
}

/// Fixed region layout for a roughly centred, frontal face filling the
/// frame. Used when no landmark detector is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalFaceLayout;

impl ProportionalFaceLayout {
    /// Region outlines as fractions of width and height.
    fn outline(region: FaceRegion) -> &'static [(f64, f64)] {
        match region {
            FaceRegion::LeftCheek  => &[(0.15, 0.45), (0.38, 0.45), (0.38, 0.70), (0.22, 0.72), (0.15, 0.60)],
            FaceRegion::RightCheek => &[(0.62, 0.45), (0.85, 0.45), (0.85, 0.60), (0.78, 0.72), (0.62, 0.70)],
            FaceRegion::Forehead   => &[(0.22, 0.08), (0.78, 0.08), (0.80, 0.30), (0.20, 0.30)],
            FaceRegion::TZone      => &[(0.30, 0.30), (0.70, 0.30), (0.58, 0.38), (0.56, 0.65), (0.44, 0.65), (0.42, 0.38)],
            FaceRegion::Chin       => &[(0.35, 0.80), (0.65, 0.80), (0.60, 0.95), (0.40, 0.95)],
        }
    }
}

impl RegionLocator for ProportionalFaceLayout {
    fn locate(&self, image: &ImageTensor) -> Result<Option<Vec<(FaceRegion, Polygon)>>> {
        if image.width() < 8 || image.height() < 8 {
            return Err(Error::RegionDetection(format!(
                "{}×{} is too small for region analysis", image.height(), image.width()
            )));
        }
        let (w, h) = (image.width() as f64, image.height() as f64);
        Ok(Some(
            FaceRegion::ALL
                .iter()
                .map(|&region| {
                    let polygon = Self::outline(region).iter().map(|&(fx, fy)| (fx * w, fy * h)).collect();
                    (region, polygon)
                })
                .collect(),
        ))
    }
}

/// Blacks out everything outside `polygon`, then crops to the polygon's
/// bounding box (clipped to the image).
pub fn crop_region(image: &ImageTensor, polygon: &[(f64, f64)]) -> Result<ImageTensor> {
    if polygon.len() < 3 {
        return Err(Error::RegionDetection(format!("polygon has only {} vertices", polygon.len())));
    }
    let (w, h) = (image.width() as f64, image.height() as f64);
    let min_x = polygon.iter().map(|p| p.0).fold(f64::INFINITY, f64::min).max(0.0);
    let max_x = polygon.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max).min(w);
    let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min).max(0.0);
    let max_y = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max).min(h);

    let (x0, y0) = (min_x.floor() as usize, min_y.floor() as usize);
    let (x1, y1) = (max_x.ceil() as usize, max_y.ceil() as usize);
    if x1 <= x0 || y1 <= y0 {
        return Err(Error::RegionDetection("region lies outside the image".to_string()));
    }

    let mut crop = image.crop(y0, x0, y1 - y0, x1 - x0);
    let crop_w = crop.width();
    for (i, px) in crop.data_mut().chunks_exact_mut(CHANNELS).enumerate() {
        let (cy, cx) = (i / crop_w, i % crop_w);
        let centre = ((x0 + cx) as f64 + 0.5, (y0 + cy) as f64 + 0.5);
        if !contains(polygon, centre) {
            px.fill(0.0);
        }
    }
    Ok(crop)
}

/// Even-odd point-in-polygon test.
fn contains(polygon: &[(f64, f64)], (x, y): (f64, f64)) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
