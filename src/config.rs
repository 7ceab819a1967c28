//! Configuration management
//!
//! Settings come from an optional TOML file; every field has a default and
//! command-line flags override whatever the file provides.

use crate::error::Result;
use crate::train::TrainerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "rfmforge.toml";

/// Input and output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub transactions: PathBuf,
    pub features: PathBuf,
    pub segments: PathBuf,
    pub models_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            transactions: PathBuf::from("data/raw/online_retail.csv"),
            features: PathBuf::from("data/processed/rfm_features.csv"),
            segments: PathBuf::from("data/processed/customer_segments.csv"),
            models_dir: PathBuf::from("models"),
        }
    }
}

/// K-Means training settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub n_runs: usize,
    pub silhouette_sample: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let trainer = TrainerConfig::default();
        Self {
            n_clusters: trainer.n_clusters,
            seed: trainer.seed,
            max_iterations: trainer.max_iterations,
            tolerance: trainer.tolerance,
            n_runs: trainer.n_runs,
            silhouette_sample: trainer.silhouette_sample,
        }
    }
}

impl From<&TrainingConfig> for TrainerConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            n_clusters: config.n_clusters,
            seed: config.seed,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            n_runs: config.n_runs,
            silhouette_sample: config.silhouette_sample,
        }
    }
}

/// Prediction-time settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Treat a missing training bounds file as an unavailable model
    pub require_bounds: bool,
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub training: TrainingConfig,
    pub serving: ServingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Explicit path, else `rfmforge.toml` when present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig::from(&self.training)
    }

    pub fn validate(&self) -> Result<()> {
        self.trainer_config().validate()
    }
}
