//! Real-time segment prediction
//!
//! [`Segmenter`] is the pure prediction path over immutable fitted artifacts.
//! [`SegmentService`] wraps the one-time artifact load: it is built once at
//! startup and either holds a ready segmenter or the reason it is
//! unavailable, so every request gets an explicit reply.

use crate::artifacts::ModelArtifacts;
use crate::bounds::TrainingBounds;
use crate::error::{Result, SegmentError};
use crate::features::{log_features, FeatureArray};
use crate::scaler::NormalizationParams;
use crate::segment::{Assignment, SegmentAssigner, SegmentLabelMap};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Raw RFM triple for one customer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentRequest {
    /// Days since last purchase
    pub recency: u64,
    /// Number of purchases
    pub frequency: u64,
    /// Total spend
    pub monetary: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub segment_name: String,
    pub cluster_label: usize,
}

/// Reply for one request: a segment or an explicit error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmentReply {
    Segment(SegmentResponse),
    Error { error: String },
}

impl SegmentReply {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

/// Prediction pipeline: log transform, clamp, normalize, assign
#[derive(Debug, Clone)]
pub struct Segmenter {
    params: NormalizationParams,
    bounds: Option<TrainingBounds>,
    assigner: SegmentAssigner,
}

impl Segmenter {
    pub fn new(artifacts: ModelArtifacts, labels: SegmentLabelMap) -> Self {
        Self {
            params: artifacts.params,
            bounds: artifacts.bounds,
            assigner: SegmentAssigner::new(artifacts.model, labels),
        }
    }

    pub fn load(models_dir: &Path, labels: SegmentLabelMap, require_bounds: bool) -> Result<Self> {
        let artifacts = ModelArtifacts::load(models_dir, require_bounds)?;
        Ok(Self::new(artifacts, labels))
    }

    pub fn bounds(&self) -> Option<&TrainingBounds> {
        self.bounds.as_ref()
    }

    pub fn n_clusters(&self) -> usize {
        self.assigner.model().n_clusters()
    }

    /// Clamp to the training range (when bounds are loaded) and standardize
    pub fn prepare(&self, log_scaled: &FeatureArray) -> FeatureArray {
        let clamped = match &self.bounds {
            Some(bounds) => bounds.clamp(log_scaled),
            None => *log_scaled,
        };
        self.params.transform(&clamped)
    }

    /// Assign an already log-scaled feature vector
    pub fn assign_log(&self, log_scaled: &FeatureArray) -> Assignment<'_> {
        self.assigner.assign(&self.prepare(log_scaled))
    }

    /// Segment one raw RFM triple
    pub fn segment(&self, request: &SegmentRequest) -> Result<SegmentResponse> {
        if !request.monetary.is_finite() || request.monetary < 0.0 {
            return Err(SegmentError::InvalidRequest(format!(
                "monetary must be a non-negative number, got {}",
                request.monetary
            )));
        }

        let log_scaled = log_features(
            request.recency as f64,
            request.frequency as f64,
            request.monetary,
        );
        let assignment = self.assign_log(&log_scaled);
        debug!(
            recency = request.recency,
            frequency = request.frequency,
            monetary = request.monetary,
            cluster = assignment.cluster,
            "segmented request"
        );

        Ok(SegmentResponse {
            segment_name: assignment.segment.to_string(),
            cluster_label: assignment.cluster,
        })
    }
}

/// Outcome of the startup artifact load
#[derive(Debug, Clone)]
pub enum ServiceState {
    Ready(Segmenter),
    Unavailable { reason: String },
}

/// Request handler that never fails: errors become [`SegmentReply::Error`]
#[derive(Debug, Clone)]
pub struct SegmentService {
    state: ServiceState,
}

impl SegmentService {
    /// Load artifacts once; a failed load leaves the service up but unavailable
    pub fn initialize(models_dir: &Path, labels: SegmentLabelMap, require_bounds: bool) -> Self {
        match Segmenter::load(models_dir, labels, require_bounds) {
            Ok(segmenter) => {
                info!(
                    dir = %models_dir.display(),
                    clusters = segmenter.n_clusters(),
                    clamping = segmenter.bounds().is_some(),
                    "segment service ready"
                );
                Self::from_segmenter(segmenter)
            }
            Err(err) => {
                error!(
                    error = %err,
                    "models unavailable; every request will be answered with an error"
                );
                Self {
                    state: ServiceState::Unavailable {
                        reason: err.to_string(),
                    },
                }
            }
        }
    }

    pub fn from_segmenter(segmenter: Segmenter) -> Self {
        Self {
            state: ServiceState::Ready(segmenter),
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ServiceState::Ready(_))
    }

    pub fn handle(&self, request: &SegmentRequest) -> SegmentReply {
        match &self.state {
            ServiceState::Ready(segmenter) => match segmenter.segment(request) {
                Ok(response) => SegmentReply::Segment(response),
                Err(err) => {
                    warn!(error = %err, "rejected segment request");
                    SegmentReply::error(err.to_string())
                }
            },
            ServiceState::Unavailable { reason } => {
                SegmentReply::error(format!("models unavailable: {reason}"))
            }
        }
    }

    /// Handle one JSON-encoded request
    pub fn handle_json(&self, line: &str) -> SegmentReply {
        match serde_json::from_str::<SegmentRequest>(line) {
            Ok(request) => self.handle(&request),
            Err(err) => SegmentReply::error(format!("invalid request: {err}")),
        }
    }
}
