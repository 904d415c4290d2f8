use thiserror::Error;

/// Crate-wide error type.
///
/// Missing annotations and degenerate metric denominators are deliberately
/// absent: the former are skipped and counted by the label store, the latter
/// resolve to `0.0` inside the metrics engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The corpus root (or a directory under it) could not be read.
    #[error("Corpus error: {0}")]
    Corpus(String),

    /// An inference request that is not a decodable image.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Landmark / face-region analysis failed for one request.
    #[error("Region detection failed: {0}")]
    RegionDetection(String),

    /// Missing, corrupt or architecture-mismatched checkpoint.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor / layer shape disagreement.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Server error: {0}")]
    Server(String),

    /// A request did not finish within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_category() {
        let err = Error::Checkpoint("best_model.json not found".to_string());
        assert_eq!(err.to_string(), "Checkpoint error: best_model.json not found");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn json_error_converts_to_serialization() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = bad.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
