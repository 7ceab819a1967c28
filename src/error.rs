//! Error types for the segmentation pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by the library modules
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Failures raised by feature derivation, training, persistence and serving
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Raw source data is missing or malformed
    #[error("invalid input data ({location}): {reason}")]
    InputData { location: String, reason: String },

    /// Fitted artifacts could not be loaded or failed validation
    #[error("model artifact unavailable ({}): {reason}", path.display())]
    ArtifactUnavailable { path: PathBuf, reason: String },

    /// A feature has zero variance, so standardization is undefined
    #[error("degenerate training data: feature '{feature}' has zero variance")]
    DegenerateTrainingData { feature: &'static str },

    /// Too few customers to fit the requested number of clusters
    #[error("{customers} customers is not enough to fit {clusters} clusters")]
    InsufficientData { customers: usize, clusters: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl SegmentError {
    pub(crate) fn input(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputData {
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArtifactUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
