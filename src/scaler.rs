//! Standardization fitted once on the training features

use crate::error::{Result, SegmentError};
use crate::features::{FeatureArray, FEATURE_NAMES, N_FEATURES};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Smallest standard deviation, relative to the feature mean, accepted as non-constant
const MIN_RELATIVE_STD: f64 = 1e-12;

/// Per-feature mean and population standard deviation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub mean: FeatureArray,
    pub std: FeatureArray,
}

impl NormalizationParams {
    /// Fit on a `(n_customers, 3)` matrix of log-scaled features
    ///
    /// Fails with [`SegmentError::DegenerateTrainingData`] when any feature is
    /// constant, since dividing by its deviation would be undefined.
    pub fn fit(points: &Array2<f64>) -> Result<Self> {
        if points.ncols() != N_FEATURES {
            return Err(SegmentError::InvalidConfig(format!(
                "expected {N_FEATURES} feature columns, got {}",
                points.ncols()
            )));
        }
        let mean_axis = points
            .mean_axis(Axis(0))
            .ok_or(SegmentError::InsufficientData {
                customers: 0,
                clusters: 1,
            })?;
        let std_axis = points.std_axis(Axis(0), 0.0);

        let mut mean = [0.0; N_FEATURES];
        let mut std = [0.0; N_FEATURES];
        for feature in 0..N_FEATURES {
            mean[feature] = mean_axis[feature];
            std[feature] = std_axis[feature];
            if !(std[feature] > MIN_RELATIVE_STD * (1.0 + mean[feature].abs())) {
                return Err(SegmentError::DegenerateTrainingData {
                    feature: FEATURE_NAMES[feature],
                });
            }
        }

        Ok(Self { mean, std })
    }

    /// `(x - mean) / std` per feature
    pub fn transform(&self, features: &FeatureArray) -> FeatureArray {
        let mut scaled = *features;
        for (feature, value) in scaled.iter_mut().enumerate() {
            *value = (*value - self.mean[feature]) / self.std[feature];
        }
        scaled
    }

    /// Undo [`transform`](Self::transform)
    pub fn inverse_transform(&self, scaled: &FeatureArray) -> FeatureArray {
        let mut features = *scaled;
        for (feature, value) in features.iter_mut().enumerate() {
            *value = *value * self.std[feature] + self.mean[feature];
        }
        features
    }

    /// Standardize every row of a `(n, 3)` matrix
    pub fn transform_batch(&self, points: &Array2<f64>) -> Array2<f64> {
        let mean = Array1::from(self.mean.to_vec());
        let std = Array1::from(self.std.to_vec());
        (points - &mean) / &std
    }

    /// Check parameters loaded from disk
    pub fn validate(&self) -> std::result::Result<(), String> {
        for feature in 0..N_FEATURES {
            if !self.mean[feature].is_finite() {
                return Err(format!("non-finite mean for '{}'", FEATURE_NAMES[feature]));
            }
            let std = self.std[feature];
            if !std.is_finite() || std <= 0.0 {
                return Err(format!(
                    "standard deviation for '{}' must be positive, got {std}",
                    FEATURE_NAMES[feature]
                ));
            }
        }
        Ok(())
    }
}
