//! Offline training: scaler, K-Means partition model and training bounds

use crate::artifacts::ModelArtifacts;
use crate::bounds::TrainingBounds;
use crate::error::{Result, SegmentError};
use crate::features::{CustomerFeatureVector, N_FEATURES};
use crate::scaler::NormalizationParams;
use crate::segment::{squared_distance, PartitionModel};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tracing::{debug, info};

/// K-Means training parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    /// Number of segments to fit
    pub n_clusters: usize,
    /// Seed for centroid initialization
    pub seed: u64,
    /// Upper bound on Lloyd iterations per run
    pub max_iterations: u64,
    /// Centroid shift under which a run is considered converged
    pub tolerance: f64,
    /// Independent initializations; the lowest-inertia run wins
    pub n_runs: usize,
    /// Customers used for the silhouette estimate
    pub silhouette_sample: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            n_clusters: 4,
            seed: 42,
            max_iterations: 300,
            tolerance: 1e-8,
            n_runs: 10,
            silhouette_sample: 100,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(3..=5).contains(&self.n_clusters) {
            return Err(SegmentError::InvalidConfig(format!(
                "n_clusters must be between 3 and 5 for meaningful customer segmentation, got {}",
                self.n_clusters
            )));
        }
        if self.max_iterations == 0 {
            return Err(SegmentError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.n_runs == 0 {
            return Err(SegmentError::InvalidConfig(
                "n_runs must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(SegmentError::InvalidConfig(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Summary statistics of a fitted model on its training set
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub n_customers: usize,
    pub cluster_sizes: Vec<usize>,
    /// Within-cluster sum of squares in normalized space
    pub inertia: f64,
    /// Mean silhouette coefficient over the sampled customers
    pub silhouette: f64,
}

/// Everything produced by one training run
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub params: NormalizationParams,
    pub model: PartitionModel,
    pub bounds: TrainingBounds,
    /// Cluster id of each training customer, in input order
    pub labels: Array1<usize>,
    pub report: TrainingReport,
}

/// Log-scaled features as a `(n_customers, 3)` matrix
pub fn feature_matrix(features: &[CustomerFeatureVector]) -> Array2<f64> {
    let mut data = Vec::with_capacity(features.len() * N_FEATURES);
    for customer in features {
        data.extend_from_slice(&customer.log_features());
    }
    Array2::from_shape_vec((features.len(), N_FEATURES), data)
        .unwrap_or_else(|_| Array2::zeros((0, N_FEATURES)))
}

/// Fit normalization, partition model and bounds on the full feature set
///
/// Nothing is persisted here; a degenerate feature or too few customers
/// fails the run before any artifact exists.
pub fn train(features: &[CustomerFeatureVector], config: &TrainerConfig) -> Result<TrainedModel> {
    config.validate()?;

    if features.len() < config.n_clusters {
        return Err(SegmentError::InsufficientData {
            customers: features.len(),
            clusters: config.n_clusters,
        });
    }

    let log_points = feature_matrix(features);
    let params = NormalizationParams::fit(&log_points)?;
    debug!(mean = ?params.mean, std = ?params.std, "fitted normalization");

    let normalized = params.transform_batch(&log_points);
    let model = fit_partition(&normalized, config)?;

    let labels = model.assign_batch(&normalized);
    let inertia = model.inertia(&normalized, &labels);
    let cluster_sizes = cluster_sizes(&labels, model.n_clusters());
    let silhouette = silhouette_sample(
        &normalized,
        &labels,
        model.n_clusters(),
        config.silhouette_sample,
        config.seed,
    );

    let bounds = TrainingBounds::from_points(&log_points).ok_or(SegmentError::InsufficientData {
        customers: 0,
        clusters: config.n_clusters,
    })?;

    info!(
        customers = features.len(),
        clusters = model.n_clusters(),
        inertia,
        silhouette,
        "trained partition model"
    );

    Ok(TrainedModel {
        params,
        model,
        bounds,
        labels,
        report: TrainingReport {
            n_customers: features.len(),
            cluster_sizes,
            inertia,
            silhouette,
        },
    })
}

/// Train on `features` and persist the artifacts into `models_dir`
///
/// Artifacts are written only after training succeeded, so a rejected run
/// leaves the directory as it was.
pub fn train_and_save(
    features: &[CustomerFeatureVector],
    config: &TrainerConfig,
    models_dir: &Path,
) -> Result<TrainedModel> {
    let trained = train(features, config)?;
    ModelArtifacts::from_trained(&trained, config).save(models_dir)?;
    Ok(trained)
}

/// Lloyd iterations with k-means++ seeding, reproducible for a given seed
fn fit_partition(normalized: &Array2<f64>, config: &TrainerConfig) -> Result<PartitionModel> {
    let n_samples = normalized.nrows();
    // Dummy targets for unsupervised learning
    let targets: Array1<usize> = Array1::zeros(n_samples);
    let dataset = Dataset::new(normalized.clone(), targets);

    let rng = StdRng::seed_from_u64(config.seed);
    let fitted = KMeans::params_with(config.n_clusters, rng, L2Dist)
        .max_n_iterations(config.max_iterations)
        .tolerance(config.tolerance)
        .n_runs(config.n_runs)
        .fit(&dataset)
        .map_err(|err| SegmentError::Clustering(err.to_string()))?;

    PartitionModel::new(fitted.centroids().clone())
}

/// Training customers per cluster
pub fn cluster_sizes(labels: &Array1<usize>, n_clusters: usize) -> Vec<usize> {
    let mut sizes = vec![0; n_clusters];
    for &label in labels.iter() {
        if label < n_clusters {
            sizes[label] += 1;
        }
    }
    sizes
}

/// Mean silhouette coefficient over a seeded random sample of `sample_size` points
///
/// Distances are taken within the sample. A point with no other sampled
/// member in its cluster scores 0. Returns 0.0 when fewer than two points
/// are sampled.
pub fn silhouette_sample(
    points: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
    sample_size: usize,
    seed: u64,
) -> f64 {
    let n_points = points.nrows().min(labels.len());
    let sample: Vec<usize> = if sample_size >= n_points {
        (0..n_points).collect()
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = rand::seq::index::sample(&mut rng, n_points, sample_size).into_vec();
        picked.sort_unstable();
        picked
    };
    if sample.len() < 2 {
        return 0.0;
    }

    let mut silhouette_sum = 0.0;
    for &i in &sample {
        let point = points.row(i);
        let own = labels[i];

        // Per cluster: (sum of distances, count)
        let mut totals = vec![(0.0f64, 0usize); n_clusters];
        for &j in &sample {
            if i == j || labels[j] >= n_clusters {
                continue;
            }
            let distance = squared_distance(&point, &points.row(j)).sqrt();
            let entry = &mut totals[labels[j]];
            entry.0 += distance;
            entry.1 += 1;
        }

        let (own_sum, own_count) = totals.get(own).copied().unwrap_or((0.0, 0));
        if own_count == 0 {
            continue;
        }
        let a_i = own_sum / own_count as f64;
        let b_i = totals
            .iter()
            .enumerate()
            .filter(|&(cluster, &(_, count))| cluster != own && count > 0)
            .map(|(_, &(sum, count))| sum / count as f64)
            .fold(f64::INFINITY, f64::min);

        let scale = a_i.max(b_i);
        if b_i.is_finite() && scale > 0.0 {
            silhouette_sum += (b_i - a_i) / scale;
        }
    }

    silhouette_sum / sample.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four well separated groups of customers
    fn grouped_customers() -> Vec<CustomerFeatureVector> {
        let groups = [
            (3u64, 20u64, 5000.0),
            (400, 1, 15.0),
            (10, 1, 40.0),
            (200, 8, 900.0),
        ];
        let mut customers = Vec::new();
        for (group, &(recency, frequency, monetary)) in groups.iter().enumerate() {
            for offset in 0..5u64 {
                customers.push(CustomerFeatureVector {
                    customer_id: (group as i64) * 100 + offset as i64,
                    recency: recency + offset,
                    frequency,
                    monetary: monetary * (1.0 + offset as f64 * 0.01),
                });
            }
        }
        customers
    }

    #[test]
    fn test_train_recovers_groups() {
        let customers = grouped_customers();
        let trained = train(&customers, &TrainerConfig::default()).unwrap();

        assert_eq!(trained.model.n_clusters(), 4);
        assert_eq!(trained.labels.len(), customers.len());
        let mut sizes = trained.report.cluster_sizes.clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![5, 5, 5, 5]);

        let groups: Vec<&[usize]> = trained.labels.as_slice().unwrap().chunks(5).collect();
        for group in &groups {
            assert!(group.iter().all(|&label| label == group[0]));
        }
        let mut leaders: Vec<usize> = groups.iter().map(|group| group[0]).collect();
        leaders.sort_unstable();
        leaders.dedup();
        assert_eq!(leaders.len(), 4);
        assert!(trained.report.silhouette > 0.3);
        assert!(trained.report.inertia.is_finite() && trained.report.inertia >= 0.0);
    }

    #[test]
    fn test_train_is_reproducible() {
        let customers = grouped_customers();
        let config = TrainerConfig::default();
        let first = train(&customers, &config).unwrap();
        let second = train(&customers, &config).unwrap();

        assert_eq!(first.model, second.model);
        assert_eq!(first.params, second.params);
        assert_eq!(first.bounds, second.bounds);
    }

    #[test]
    fn test_bounds_cover_training_features() {
        let customers = grouped_customers();
        let trained = train(&customers, &TrainerConfig::default()).unwrap();

        for customer in &customers {
            assert!(trained.bounds.contains(&customer.log_features()));
        }
        assert!((trained.bounds.min[0] - 4.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_feature_fails() {
        let customers: Vec<CustomerFeatureVector> = (0..8)
            .map(|i| CustomerFeatureVector {
                customer_id: i,
                recency: 10 + i as u64,
                frequency: 1,
                monetary: 50.0 + i as f64,
            })
            .collect();

        let err = train(&customers, &TrainerConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::DegenerateTrainingData {
                feature: "frequency"
            }
        ));
    }

    #[test]
    fn test_too_few_customers() {
        let customers = grouped_customers()[..3].to_vec();
        let err = train(&customers, &TrainerConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::InsufficientData {
                customers: 3,
                clusters: 4
            }
        ));

        assert!(train(&[], &TrainerConfig::default()).is_err());
    }

    #[test]
    fn test_invalid_cluster_count() {
        let customers = grouped_customers();
        for n_clusters in [2, 6] {
            let config = TrainerConfig {
                n_clusters,
                ..TrainerConfig::default()
            };
            assert!(matches!(
                train(&customers, &config),
                Err(SegmentError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_cluster_sizes_and_silhouette() {
        let labels = Array1::from(vec![0, 0, 1, 2, 7]);
        assert_eq!(cluster_sizes(&labels, 3), vec![2, 1, 1]);

        let points = Array2::zeros((1, 3));
        assert_eq!(silhouette_sample(&points, &Array1::from(vec![0]), 3, 100, 42), 0.0);
    }

    #[test]
    fn test_silhouette_singletons_score_zero() {
        let points = ndarray::array![[0.0, 0.0, 0.0], [5.0, 0.0, 0.0], [0.0, 9.0, 0.0]];
        let labels = Array1::from(vec![0, 1, 2]);
        assert_eq!(silhouette_sample(&points, &labels, 3, 100, 42), 0.0);

        // Two tight pairs plus one lone point: the lone point contributes 0
        let points = ndarray::array![
            [0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [10.0, 0.0, 0.0],
            [10.0, 1.0, 0.0],
            [50.0, 0.0, 0.0],
        ];
        let labels = Array1::from(vec![0, 0, 1, 1, 2]);
        let score = silhouette_sample(&points, &labels, 3, 100, 42);
        let pairs_only = silhouette_sample(
            &points.slice(ndarray::s![..4, ..]).to_owned(),
            &Array1::from(vec![0, 0, 1, 1]),
            3,
            100,
            42,
        );
        assert!(score > 0.0 && score < pairs_only);
        assert!((score - pairs_only * 4.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_silhouette_sample_is_seeded() {
        let customers = grouped_customers();
        let trained = train(&customers, &TrainerConfig::default()).unwrap();
        let normalized = trained.params.transform_batch(&feature_matrix(&customers));
        let labels = &trained.labels;

        let first = silhouette_sample(&normalized, labels, 4, 8, 7);
        let second = silhouette_sample(&normalized, labels, 4, 8, 7);
        assert_eq!(first, second);
        assert!(first.is_finite() && (-1.0..=1.0).contains(&first));
    }
}
