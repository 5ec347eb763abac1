//! JSON configuration for the server.
//!
//! Required fields fail loading with a [`ConfigError`] so the process can
//! exit non-zero before any thread starts. Everything else has a default.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TemperingConfig {
    pub stacks: usize,
    pub chains: usize,
    #[serde(default = "default_swap_interval")]
    pub swap_interval: u64,
}

fn default_swap_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub dimensionality: usize,
    pub parallel_tempering: TemperingConfig,
    pub n_samples_total: u64,
    pub n_job_types: u32,
    #[serde(default = "default_accept_rate")]
    pub optimal_accept_rate: f64,
    #[serde(default = "default_swap_rate")]
    pub optimal_swap_rate: f64,
    #[serde(default = "default_logging_rate")]
    pub logging_rate_sec: f64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_sec: u64,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default)]
    pub recover: bool,
    #[serde(default)]
    pub use_initial: bool,
    #[serde(default)]
    pub initial: Vec<f64>,
    #[serde(default)]
    pub min: Vec<f64>,
    #[serde(default)]
    pub max: Vec<f64>,
    #[serde(default = "default_epsr_threshold")]
    pub epsr_threshold: f64,
}

fn default_accept_rate() -> f64 {
    0.24
}

fn default_swap_rate() -> f64 {
    0.24
}

fn default_logging_rate() -> f64 {
    1.0
}

fn default_heartbeat_timeout() -> u64 {
    15
}

fn default_output_path() -> PathBuf {
    PathBuf::from("output")
}

fn default_epsr_threshold() -> f64 {
    1.1
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensionality == 0 {
            return Err(ConfigError::Invalid("dimensionality must be positive".into()));
        }
        if self.parallel_tempering.stacks == 0 || self.parallel_tempering.chains == 0 {
            return Err(ConfigError::Invalid(
                "parallelTempering.stacks and .chains must be positive".into(),
            ));
        }
        if self.n_job_types == 0 {
            return Err(ConfigError::Invalid("nJobTypes must be positive".into()));
        }
        if self.use_initial && self.initial.len() != self.dimensionality {
            return Err(ConfigError::Invalid(format!(
                "initial has {} entries, expected {}",
                self.initial.len(),
                self.dimensionality
            )));
        }
        if !self.min.is_empty() || !self.max.is_empty() {
            if self.min.len() != self.dimensionality || self.max.len() != self.dimensionality {
                return Err(ConfigError::Invalid(format!(
                    "min/max must both have {} entries",
                    self.dimensionality
                )));
            }
            if self.min.iter().zip(&self.max).any(|(lo, hi)| lo >= hi) {
                return Err(ConfigError::Invalid("min must be below max".into()));
            }
        }
        Ok(())
    }

    /// Proposal bounds when both vectors are configured.
    pub fn bounds(&self) -> Option<kiln_infer::ProposalBounds> {
        if self.min.len() == self.dimensionality && self.max.len() == self.dimensionality {
            Some(kiln_infer::ProposalBounds {
                min: nalgebra::DVector::from_vec(self.min.clone()),
                max: nalgebra::DVector::from_vec(self.max.clone()),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let (_dir, path) = write_config(
            r#"{
                "dimensionality": 3,
                "parallelTempering": { "stacks": 2, "chains": 4 },
                "nSamplesTotal": 1000,
                "nJobTypes": 1
            }"#,
        );
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.dimensionality, 3);
        assert_eq!(config.parallel_tempering.swap_interval, 10);
        assert_eq!(config.optimal_accept_rate, 0.24);
        assert_eq!(config.heartbeat_timeout_sec, 15);
        assert_eq!(config.output_path, PathBuf::from("output"));
        assert!(!config.use_initial);
        assert!(config.bounds().is_none());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let (_dir, path) = write_config(
            r#"{
                "parallelTempering": { "stacks": 2, "chains": 4 },
                "nSamplesTotal": 1000,
                "nJobTypes": 1
            }"#,
        );
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn initial_vector_must_match_dimensionality() {
        let (_dir, path) = write_config(
            r#"{
                "dimensionality": 3,
                "parallelTempering": { "stacks": 1, "chains": 1 },
                "nSamplesTotal": 10,
                "nJobTypes": 1,
                "useInitial": true,
                "initial": [1.0, 2.0]
            }"#,
        );
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bounds_require_consistent_ordering() {
        let (_dir, path) = write_config(
            r#"{
                "dimensionality": 2,
                "parallelTempering": { "stacks": 1, "chains": 1 },
                "nSamplesTotal": 10,
                "nJobTypes": 1,
                "min": [0.0, 5.0],
                "max": [1.0, 4.0]
            }"#,
        );
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn full_config_parses_bounds() {
        let (_dir, path) = write_config(
            r#"{
                "dimensionality": 2,
                "parallelTempering": { "stacks": 2, "chains": 3, "swapInterval": 7 },
                "nSamplesTotal": 500,
                "nJobTypes": 3,
                "optimalAcceptRate": 0.3,
                "optimalSwapRate": 0.2,
                "loggingRateSec": 5.0,
                "heartbeatTimeoutSec": 30,
                "outputPath": "/tmp/kiln-out",
                "useInitial": true,
                "initial": [0.5, 0.5],
                "min": [-1.0, -1.0],
                "max": [1.0, 1.0]
            }"#,
        );
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.parallel_tempering.swap_interval, 7);
        assert_eq!(config.heartbeat_timeout_sec, 30);
        let bounds = config.bounds().unwrap();
        assert_eq!(bounds.min[0], -1.0);
        assert_eq!(bounds.max[1], 1.0);
    }
}
