//! Per-feature bounds captured at training time

use crate::features::{FeatureArray, FEATURE_NAMES, N_FEATURES};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Closed `[min, max]` interval per log-scaled feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingBounds {
    pub min: FeatureArray,
    pub max: FeatureArray,
}

impl TrainingBounds {
    /// Column-wise min/max of a `(n_customers, 3)` matrix; `None` when it has no rows
    pub fn from_points(points: &Array2<f64>) -> Option<Self> {
        if points.nrows() == 0 || points.ncols() != N_FEATURES {
            return None;
        }

        let mut min = [f64::INFINITY; N_FEATURES];
        let mut max = [f64::NEG_INFINITY; N_FEATURES];
        for row in points.outer_iter() {
            for (feature, &value) in row.iter().enumerate() {
                min[feature] = min[feature].min(value);
                max[feature] = max[feature].max(value);
            }
        }

        Some(Self { min, max })
    }

    /// Clip each feature into its training interval
    pub fn clamp(&self, features: &FeatureArray) -> FeatureArray {
        let mut clamped = *features;
        for (feature, value) in clamped.iter_mut().enumerate() {
            // f64::clamp panics on inverted bounds
            *value = value.max(self.min[feature]).min(self.max[feature]);
        }
        clamped
    }

    pub fn contains(&self, features: &FeatureArray) -> bool {
        features
            .iter()
            .enumerate()
            .all(|(feature, &value)| value >= self.min[feature] && value <= self.max[feature])
    }

    /// Check bounds loaded from disk
    pub fn validate(&self) -> Result<(), String> {
        for feature in 0..N_FEATURES {
            let (lo, hi) = (self.min[feature], self.max[feature]);
            if !lo.is_finite() || !hi.is_finite() {
                return Err(format!("non-finite bound for '{}'", FEATURE_NAMES[feature]));
            }
            if lo > hi {
                return Err(format!(
                    "inverted bounds for '{}': {lo} > {hi}",
                    FEATURE_NAMES[feature]
                ));
            }
        }
        Ok(())
    }
}
