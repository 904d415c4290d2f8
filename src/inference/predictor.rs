use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::data::augment::Pipeline;
use crate::data::tensor::ImageTensor;
use crate::error::{Error, Result};
use crate::inference::regions::{crop_region, FaceRegion, RegionLocator};
use crate::inference::severity::{ConditionPrediction, SeverityStrategy};
use crate::labels::{Condition, ConditionMap};
use crate::network::classifier::SkinClassifier;
use crate::network::spec::Architecture;
use crate::train::checkpoint::ModelCheckpoint;

/// One row of an inference response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concern {
    pub name: String,
    pub severity: String,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub concerns: Vec<Concern>,
    /// Per-region breakdown; `null` when region analysis is off or failed.
    pub region_concerns: Option<BTreeMap<FaceRegion, Vec<Concern>>>,
}

/// A loaded model ready to answer predictions.
///
/// The model sits behind an `Arc` and is never mutated, so a service can be
/// shared freely between request threads.
pub struct InferenceService {
    model: Arc<SkinClassifier>,
    pipeline: Pipeline,
    strategy: SeverityStrategy,
    locator: Option<Box<dyn RegionLocator>>,
}

impl InferenceService {
    pub fn new(model: SkinClassifier, image_size: usize) -> InferenceService {
        InferenceService {
            model: Arc::new(model),
            pipeline: Pipeline::eval(image_size),
            strategy: SeverityStrategy::default(),
            locator: None,
        }
    }

    /// Loads a checkpoint and uses the image size it was trained with.
    ///
    /// Fails with `Error::Checkpoint` when the file is missing, corrupt, or
    /// holds a different architecture than `expected`.
    pub fn load(path: &Path, expected: Option<Architecture>) -> Result<InferenceService> {
        let checkpoint = ModelCheckpoint::load(path)?;
        let actual = checkpoint.model.spec().architecture;
        if let Some(expected) = expected.filter(|&e| e != actual) {
            return Err(Error::Checkpoint(format!(
                "{} holds a {} model, expected {}", path.display(), actual, expected
            )));
        }
        info!(
            "Loaded {} model from {} (epoch {}, image size {})",
            actual, path.display(), checkpoint.epoch, checkpoint.config.image_size
        );
        Ok(InferenceService::new(checkpoint.model, checkpoint.config.image_size))
    }

    pub fn with_strategy(mut self, strategy: SeverityStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enables per-region analysis.
    pub fn with_region_locator(mut self, locator: Box<dyn RegionLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn model(&self) -> &SkinClassifier {
        &self.model
    }

    pub fn strategy(&self) -> SeverityStrategy {
        self.strategy
    }

    /// Eval preprocessing plus one forward pass.
    pub fn predict(&self, image: &ImageTensor) -> Result<ConditionMap<ConditionPrediction>> {
        // The eval pipeline draws no random numbers; the generator only
        // satisfies the transform signature.
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let input = self.pipeline.apply(image.clone(), &mut rng)?;
        let trace = self.model.trace(&input)?;
        let probabilities = trace.presence_probabilities();
        let logits = trace.severity_logits();
        Ok(ConditionMap::from_fn(|c| ConditionPrediction::new(c, probabilities[c], &logits[c])))
    }

    /// Full response for a decoded image. A region failure only drops the
    /// region breakdown.
    pub fn predict_image(&self, image: &ImageTensor) -> Result<InferenceResponse> {
        let concerns = self.concerns(&self.predict(image)?);
        let region_concerns = match &self.locator {
            None => None,
            Some(locator) => match self.analyze_regions(locator.as_ref(), image) {
                Ok(regions) => regions,
                Err(e) => {
                    warn!("Region analysis skipped: {}", e);
                    None
                }
            },
        };
        Ok(InferenceResponse { concerns, region_concerns })
    }

    /// Decodes encoded image bytes first; undecodable input is
    /// `Error::InvalidInput`.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<InferenceResponse> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("empty image upload".to_string()));
        }
        let image = ImageTensor::decode(bytes)?;
        debug!("Decoded {}×{} upload", image.width(), image.height());
        self.predict_image(&image)
    }

    fn analyze_regions(
        &self,
        locator: &dyn RegionLocator,
        image: &ImageTensor,
    ) -> Result<Option<BTreeMap<FaceRegion, Vec<Concern>>>> {
        let Some(regions) = locator.locate(image)? else {
            debug!("No face found; region analysis skipped");
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        for (region, polygon) in regions {
            let crop = crop_region(image, &polygon)
                .map_err(|e| Error::RegionDetection(format!("{}: {}", region, e)))?;
            out.insert(region, self.concerns(&self.predict(&crop)?));
        }
        Ok(Some(out))
    }

    fn concerns(&self, predictions: &ConditionMap<ConditionPrediction>) -> Vec<Concern> {
        Condition::ALL
            .iter()
            .map(|&c| {
                let p = &predictions[c];
                Concern {
                    name: c.display_name(),
                    severity: p.severity_label(self.strategy).to_string(),
                    percentage: p.percentage(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::regions::{Polygon, ProportionalFaceLayout};
    use crate::network::spec::ModelSpec;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn service() -> InferenceService {
        let spec = ModelSpec { architecture: Architecture::GridPoolSmall, head_hidden: 4, dropout: 0.3 };
        InferenceService::new(SkinClassifier::new(spec, 3).unwrap(), 16)
    }

    fn face(h: u32, w: u32) -> ImageTensor {
        ImageTensor::from_rgb(&RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 120])))
    }

    struct Broken;

    impl RegionLocator for Broken {
        fn locate(&self, _: &ImageTensor) -> Result<Option<Vec<(FaceRegion, Polygon)>>> {
            Err(Error::RegionDetection("detector crashed".to_string()))
        }
    }

    #[test]
    fn reports_all_conditions_in_order() {
        let response = service().predict_image(&face(20, 20)).unwrap();
        let names: Vec<_> = response.concerns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names[2], "Fine Lines Wrinkles");
        assert_eq!(names.len(), 7);
        assert!(response.region_concerns.is_none());
    }

    #[test]
    fn prediction_is_deterministic() {
        let svc = service();
        assert_eq!(svc.predict(&face(30, 24)).unwrap(), svc.predict(&face(30, 24)).unwrap());
    }

    #[test]
    fn regions_are_reported_when_located() {
        let svc = service().with_region_locator(Box::new(ProportionalFaceLayout));
        let regions = svc.predict_image(&face(40, 40)).unwrap().region_concerns.unwrap();
        assert_eq!(regions.len(), 5);
        assert_eq!(regions[&FaceRegion::Chin].len(), 7);
    }

    #[test]
    fn region_failure_keeps_the_main_result() {
        let svc = service().with_region_locator(Box::new(Broken));
        let response = svc.predict_image(&face(20, 20)).unwrap();
        assert_eq!(response.concerns.len(), 7);
        assert!(response.region_concerns.is_none());
    }

    #[test]
    fn undecodable_bytes_are_invalid_input() {
        let svc = service();
        assert!(matches!(svc.predict_bytes(b"definitely not a png"), Err(Error::InvalidInput(_))));
        assert!(matches!(svc.predict_bytes(&[]), Err(Error::InvalidInput(_))));

        let mut png = Vec::new();
        RgbImage::from_pixel(12, 12, Rgb([200, 120, 90]))
            .write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();
        assert!(svc.predict_bytes(&png).is_ok());
    }

    #[test]
    fn region_response_serializes_with_snake_case_keys() {
        let svc = service().with_region_locator(Box::new(ProportionalFaceLayout));
        let json = serde_json::to_value(svc.predict_image(&face(40, 40)).unwrap()).unwrap();
        assert!(json["region_concerns"]["t_zone"].is_array());
        assert!(json["concerns"][0]["percentage"].is_u64());
    }
}
