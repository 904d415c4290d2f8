pub mod config;
pub mod multipart;
pub mod predictor;
pub mod regions;
pub mod server;
pub mod severity;

pub use config::ServeConfig;
pub use predictor::{Concern, InferenceResponse, InferenceService};
pub use regions::{
    crop_region, FaceRegion, Landmark, LandmarkDetector, LandmarkRegionLocator, Polygon,
    ProportionalFaceLayout, RegionLocator,
};
pub use server::{route, serve, ApiResponse, InferenceWorker};
pub use severity::{bucket_for_probability, ConditionPrediction, SeverityBucket, SeverityStrategy};
