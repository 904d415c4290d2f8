use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::inference::severity::SeverityStrategy;
use crate::network::spec::Architecture;

pub const DEFAULT_PORT: u16 = 8000;

/// Settings of the HTTP inference service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeConfig {
    pub checkpoint: PathBuf,
    pub host: String,
    pub port: u16,
    /// Deadline for one `/infer` request, queueing included.
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Uploads waiting for the compute thread beyond this are refused.
    pub queue_depth: usize,
    pub strategy: SeverityStrategy,
    pub regions: bool,
    /// Refuse to start unless the checkpoint holds this architecture.
    pub expected_architecture: Option<Architecture>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            checkpoint: PathBuf::from("checkpoints/best_model.json"),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            request_timeout: Duration::from_secs(30),
            max_upload_bytes: 10 * 1024 * 1024,
            queue_depth: 16,
            strategy: SeverityStrategy::Threshold,
            regions: true,
            expected_architecture: None,
        }
    }
}

impl ServeConfig {
    /// Defaults overridden by `MODEL_CHECKPOINT` and `PORT`.
    pub fn from_env() -> Result<ServeConfig> {
        ServeConfig::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<ServeConfig> {
        let mut config = ServeConfig::default();
        if let Some(path) = lookup("MODEL_CHECKPOINT").filter(|p| !p.is_empty()) {
            config.checkpoint = PathBuf::from(path);
        }
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got '{}'", port)))?;
        }
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let config = ServeConfig::from_lookup(|key| match key {
            "MODEL_CHECKPOINT" => Some("/models/best.json".to_string()),
            "PORT" => Some("9100".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.checkpoint, PathBuf::from("/models/best.json"));
        assert_eq!(config.address(), "0.0.0.0:9100");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unset_environment_keeps_port_8000() {
        let config = ServeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn bad_port_is_a_config_error() {
        let result = ServeConfig::from_lookup(|k| (k == "PORT").then(|| "eighty".to_string()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
