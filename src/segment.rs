//! Nearest-centroid assignment and segment labels

use crate::error::{Result, SegmentError};
use crate::features::{FeatureArray, N_FEATURES};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Label returned for cluster ids without a name
pub const UNKNOWN_SEGMENT: &str = "Unknown Segment";

/// Segment names indexed by cluster id
const DEFAULT_SEGMENTS: [&str; 4] = ["Champions", "Lost Customers", "New Customers", "At-Risk"];

/// Fitted centroids in normalized feature space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionModel {
    centroids: Array2<f64>,
}

impl PartitionModel {
    /// Wrap a `(n_clusters, 3)` centroid matrix
    pub fn new(centroids: Array2<f64>) -> Result<Self> {
        let model = Self { centroids };
        model.validate().map_err(SegmentError::Clustering)?;
        Ok(model)
    }

    /// Check centroids loaded from disk
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.centroids.nrows() == 0 {
            return Err("partition model has no centroids".to_string());
        }
        if self.centroids.ncols() != N_FEATURES {
            return Err(format!(
                "centroids must have {N_FEATURES} dimensions, got {}",
                self.centroids.ncols()
            ));
        }
        if self.centroids.iter().any(|value| !value.is_finite()) {
            return Err("centroids contain non-finite values".to_string());
        }
        Ok(())
    }

    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }

    /// Id of the nearest centroid under Euclidean distance
    ///
    /// Only a strictly smaller distance replaces the current best, so ties go
    /// to the lowest id.
    pub fn assign(&self, features: &FeatureArray) -> usize {
        let point = ArrayView1::from(&features[..]);
        self.nearest(&point)
    }

    /// Assign every row of a `(n, 3)` matrix
    pub fn assign_batch(&self, points: &Array2<f64>) -> Array1<usize> {
        points
            .outer_iter()
            .map(|row| self.nearest(&row))
            .collect()
    }

    /// Within-cluster sum of squared distances for the given assignment
    pub fn inertia(&self, points: &Array2<f64>, labels: &Array1<usize>) -> f64 {
        points
            .outer_iter()
            .zip(labels.iter())
            .filter(|(_, &cluster)| cluster < self.n_clusters())
            .map(|(row, &cluster)| squared_distance(&row, &self.centroids.row(cluster)))
            .sum()
    }

    fn nearest(&self, point: &ArrayView1<f64>) -> usize {
        let mut min_distance = f64::INFINITY;
        let mut closest_cluster = 0;

        for (cluster_idx, centroid) in self.centroids.outer_iter().enumerate() {
            // Squared distance preserves both the ordering and the ties
            let distance = squared_distance(point, &centroid);
            if distance < min_distance {
                min_distance = distance;
                closest_cluster = cluster_idx;
            }
        }

        closest_cluster
    }
}

pub(crate) fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Fixed cluster id to segment name table
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentLabelMap {
    labels: Vec<String>,
}

impl Default for SegmentLabelMap {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENTS.iter().map(|name| name.to_string()).collect())
    }
}

impl SegmentLabelMap {
    /// Names in cluster id order
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn get(&self, cluster: usize) -> Option<&str> {
        self.labels.get(cluster).map(String::as_str)
    }

    /// Name for `cluster`, or [`UNKNOWN_SEGMENT`] when it has none
    pub fn label(&self, cluster: usize) -> &str {
        self.get(cluster).unwrap_or_else(|| {
            warn!(cluster, "cluster id has no segment label");
            UNKNOWN_SEGMENT
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Outcome of assigning one normalized vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment<'a> {
    pub cluster: usize,
    pub segment: &'a str,
}

/// Partition model plus the label table it reports through
#[derive(Debug, Clone)]
pub struct SegmentAssigner {
    model: PartitionModel,
    labels: SegmentLabelMap,
}

impl SegmentAssigner {
    pub fn new(model: PartitionModel, labels: SegmentLabelMap) -> Self {
        if labels.len() < model.n_clusters() {
            warn!(
                clusters = model.n_clusters(),
                labels = labels.len(),
                "fewer segment labels than clusters; unlabeled clusters report the unknown segment"
            );
        }
        Self { model, labels }
    }

    pub fn model(&self) -> &PartitionModel {
        &self.model
    }

    pub fn labels(&self) -> &SegmentLabelMap {
        &self.labels
    }

    pub fn assign(&self, normalized: &FeatureArray) -> Assignment<'_> {
        let cluster = self.model.assign(normalized);
        Assignment {
            cluster,
            segment: self.labels.label(cluster),
        }
    }
}
