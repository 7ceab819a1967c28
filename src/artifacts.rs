//! Persistence of fitted artifacts
//!
//! A model directory holds three JSON files: the scaler, the partition model
//! with its training metadata, and the training bounds. Every file carries
//! the same training id. Saves go through temporary siblings that are renamed
//! into place only after every file was written, and temporaries are removed
//! on any failure. A directory whose files disagree on the training id is
//! rejected on load, so an interrupted save never serves a mixed set.

use crate::bounds::TrainingBounds;
use crate::error::{Result, SegmentError};
use crate::scaler::NormalizationParams;
use crate::segment::PartitionModel;
use crate::train::{TrainedModel, TrainerConfig};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SCALER_FILE: &str = "scaler.json";
pub const MODEL_FILE: &str = "kmeans_model.json";
pub const BOUNDS_FILE: &str = "training_bounds.json";

/// Locations of the artifact files inside a model directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub scaler: PathBuf,
    pub model: PathBuf,
    pub bounds: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            scaler: dir.join(SCALER_FILE),
            model: dir.join(MODEL_FILE),
            bounds: dir.join(BOUNDS_FILE),
        }
    }
}

/// Provenance stored next to the centroids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Shared by the three files written by one save
    pub training_id: String,
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iterations: u64,
    pub n_customers: usize,
    pub inertia: f64,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelFile {
    metadata: ModelMetadata,
    model: PartitionModel,
}

/// Scaler or bounds payload tagged with the training id
#[derive(Debug, Serialize, Deserialize)]
struct StampedFile<T> {
    training_id: String,
    #[serde(flatten)]
    value: T,
}

/// Id tying together the files of one training run
pub fn new_training_id(trained_at: DateTime<Utc>) -> String {
    format!(
        "{}-{:016x}",
        trained_at.format("%Y%m%dT%H%M%S%.6fZ"),
        rand::random::<u64>()
    )
}

/// The fitted parameters a serving process loads once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifacts {
    pub params: NormalizationParams,
    pub model: PartitionModel,
    pub bounds: Option<TrainingBounds>,
    pub metadata: ModelMetadata,
}

impl ModelArtifacts {
    pub fn from_trained(trained: &TrainedModel, config: &TrainerConfig) -> Self {
        let trained_at = Utc::now();
        Self {
            params: trained.params,
            model: trained.model.clone(),
            bounds: Some(trained.bounds),
            metadata: ModelMetadata {
                training_id: new_training_id(trained_at),
                n_clusters: trained.model.n_clusters(),
                seed: config.seed,
                max_iterations: config.max_iterations,
                n_customers: trained.report.n_customers,
                inertia: trained.report.inertia,
                trained_at,
            },
        }
    }

    /// Write all artifacts into `dir`, creating it if needed
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let paths = ArtifactPaths::in_dir(dir);

        let mut staged = Vec::new();
        let written = self
            .stage_all(&paths, &mut staged)
            .and_then(|()| {
                for (temporary, target) in &staged {
                    fs::rename(temporary, target)?;
                }
                Ok(())
            });
        if let Err(err) = written {
            for (temporary, _) in &staged {
                let _ = fs::remove_file(temporary);
            }
            return Err(err);
        }

        if self.bounds.is_none() {
            remove_if_exists(&paths.bounds)?;
        }

        info!(dir = %dir.display(), clusters = self.model.n_clusters(), "saved model artifacts");
        Ok(())
    }

    /// Write every file to its temporary sibling, recording each one in `staged`
    fn stage_all(
        &self,
        paths: &ArtifactPaths,
        staged: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<()> {
        let training_id = &self.metadata.training_id;

        let scaler = StampedFile {
            training_id: training_id.clone(),
            value: self.params,
        };
        staged.push((stage_json(&paths.scaler, &scaler)?, paths.scaler.clone()));

        let model_file = ModelFile {
            metadata: self.metadata.clone(),
            model: self.model.clone(),
        };
        staged.push((stage_json(&paths.model, &model_file)?, paths.model.clone()));

        if let Some(bounds) = self.bounds {
            let bounds = StampedFile {
                training_id: training_id.clone(),
                value: bounds,
            };
            staged.push((stage_json(&paths.bounds, &bounds)?, paths.bounds.clone()));
        }
        Ok(())
    }

    /// Load and validate the artifacts in `dir`
    ///
    /// A missing bounds file is tolerated unless `require_bounds` is set.
    /// Every other problem is reported as [`SegmentError::ArtifactUnavailable`].
    pub fn load(dir: &Path, require_bounds: bool) -> Result<Self> {
        let paths = ArtifactPaths::in_dir(dir);

        let model_file: ModelFile = read_json(&paths.model)?;
        model_file
            .model
            .validate()
            .map_err(|reason| SegmentError::unavailable(&paths.model, reason))?;
        let metadata = model_file.metadata;
        if metadata.n_clusters != model_file.model.n_clusters() {
            return Err(SegmentError::unavailable(
                &paths.model,
                format!(
                    "metadata declares {} clusters but the model has {} centroids",
                    metadata.n_clusters,
                    model_file.model.n_clusters()
                ),
            ));
        }

        let scaler: StampedFile<NormalizationParams> = read_json(&paths.scaler)?;
        check_training_id(&paths.scaler, &scaler.training_id, &metadata.training_id)?;
        let params = scaler.value;
        params
            .validate()
            .map_err(|reason| SegmentError::unavailable(&paths.scaler, reason))?;

        let bounds = match read_json::<StampedFile<TrainingBounds>>(&paths.bounds) {
            Ok(stamped) => {
                check_training_id(&paths.bounds, &stamped.training_id, &metadata.training_id)?;
                let bounds = stamped.value;
                bounds
                    .validate()
                    .map_err(|reason| SegmentError::unavailable(&paths.bounds, reason))?;
                Some(bounds)
            }
            Err(_) if !require_bounds && !paths.bounds.exists() => {
                warn!(
                    path = %paths.bounds.display(),
                    "training bounds not found; serving inputs will not be clamped"
                );
                None
            }
            Err(err) => return Err(err),
        };

        debug!(
            dir = %dir.display(),
            clusters = model_file.model.n_clusters(),
            bounds = bounds.is_some(),
            "loaded model artifacts"
        );

        Ok(Self {
            params,
            model: model_file.model,
            bounds,
            metadata,
        })
    }
}

fn check_training_id(path: &Path, found: &str, expected: &str) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(SegmentError::unavailable(
            path,
            format!("written by training run {found}, but the model is from run {expected}"),
        ))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .map_err(|err| SegmentError::unavailable(path, err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| SegmentError::unavailable(path, err.to_string()))
}

fn stage_json<T: Serialize>(target: &Path, value: &T) -> Result<PathBuf> {
    let temporary = temporary_path(target);
    let written = File::create(&temporary)
        .map_err(SegmentError::from)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)?;
            writer.flush()?;
            Ok(())
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&temporary);
        return Err(err);
    }
    Ok(temporary)
}

fn temporary_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Write `path` through a temporary sibling, leaving any previous file intact on failure
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temporary = temporary_path(path);
    let written = File::create(&temporary)
        .map_err(SegmentError::from)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            write(&mut writer)?;
            writer.flush()?;
            Ok(())
        });

    match written {
        Ok(()) => {
            fs::rename(&temporary, path)?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&temporary);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn artifacts() -> ModelArtifacts {
        ModelArtifacts {
            params: NormalizationParams {
                mean: [3.5, 1.2, 6.0],
                std: [1.1, 0.6, 1.4],
            },
            model: PartitionModel::new(array![
                [-1.0, 1.0, 1.0],
                [1.2, -0.8, -0.9],
                [-0.9, -0.7, -0.4],
                [0.4, 0.3, 0.2],
            ])
            .unwrap(),
            bounds: Some(TrainingBounds {
                min: [0.69, 0.69, 1.0],
                max: [5.9, 5.4, 12.5],
            }),
            metadata: ModelMetadata {
                training_id: "20111209T120000.000000Z-000000000000002a".to_string(),
                n_clusters: 4,
                seed: 42,
                max_iterations: 300,
                n_customers: 4338,
                inertia: 3120.5,
                trained_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let saved = artifacts();
        saved.save(dir.path()).unwrap();

        for name in [SCALER_FILE, MODEL_FILE, BOUNDS_FILE] {
            assert!(dir.path().join(name).exists());
            assert!(!dir.path().join(format!("{name}.tmp")).exists());
        }

        let loaded = ModelArtifacts::load(dir.path(), true).unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_missing_bounds_policy() {
        let dir = tempdir().unwrap();
        let mut saved = artifacts();
        saved.bounds = None;
        saved.save(dir.path()).unwrap();

        let loaded = ModelArtifacts::load(dir.path(), false).unwrap();
        assert!(loaded.bounds.is_none());

        let err = ModelArtifacts::load(dir.path(), true).unwrap_err();
        assert!(matches!(err, SegmentError::ArtifactUnavailable { .. }));
    }

    #[test]
    fn test_saving_without_bounds_removes_stale_file() {
        let dir = tempdir().unwrap();
        artifacts().save(dir.path()).unwrap();

        let mut unbounded = artifacts();
        unbounded.bounds = None;
        unbounded.save(dir.path()).unwrap();

        assert!(!dir.path().join(BOUNDS_FILE).exists());
    }

    #[test]
    fn test_missing_directory_unavailable() {
        let dir = tempdir().unwrap();
        let err = ModelArtifacts::load(&dir.path().join("absent"), false).unwrap_err();
        assert!(matches!(err, SegmentError::ArtifactUnavailable { .. }));
    }

    #[test]
    fn test_corrupt_artifacts_unavailable() {
        let dir = tempdir().unwrap();
        artifacts().save(dir.path()).unwrap();
        fs::write(dir.path().join(MODEL_FILE), "{ not json").unwrap();

        let err = ModelArtifacts::load(dir.path(), false).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::ArtifactUnavailable { ref path, .. } if path.ends_with(MODEL_FILE)
        ));
    }

    #[test]
    fn test_invalid_scaler_unavailable() {
        let dir = tempdir().unwrap();
        let mut saved = artifacts();
        saved.params.std[1] = 0.0;
        saved.save(dir.path()).unwrap();

        assert!(ModelArtifacts::load(dir.path(), false).is_err());
    }

    #[test]
    fn test_corrupt_bounds_never_ignored() {
        let dir = tempdir().unwrap();
        artifacts().save(dir.path()).unwrap();
        fs::write(dir.path().join(BOUNDS_FILE), "[]").unwrap();

        assert!(ModelArtifacts::load(dir.path(), false).is_err());
    }

    #[test]
    fn test_failed_save_leaves_no_staged_files() {
        let dir = tempdir().unwrap();
        // A directory in the way makes staging the model file fail
        fs::create_dir(dir.path().join(format!("{MODEL_FILE}.tmp"))).unwrap();

        assert!(artifacts().save(dir.path()).is_err());
        assert!(!dir.path().join(format!("{SCALER_FILE}.tmp")).exists());
        assert!(!dir.path().join(format!("{BOUNDS_FILE}.tmp")).exists());
        for name in [SCALER_FILE, MODEL_FILE, BOUNDS_FILE] {
            assert!(!dir.path().join(name).exists());
        }
    }

    #[test]
    fn test_mixed_training_runs_rejected() {
        let dir = tempdir().unwrap();
        let older = artifacts();
        older.save(dir.path()).unwrap();
        let previous_model = fs::read_to_string(dir.path().join(MODEL_FILE)).unwrap();

        let mut newer = artifacts();
        newer.metadata.training_id = "20111210T120000.000000Z-0000000000000007".to_string();
        newer.params.mean = [9.0, 9.0, 9.0];
        newer.save(dir.path()).unwrap();
        assert!(ModelArtifacts::load(dir.path(), true).is_ok());

        // Interrupted save: new scaler and bounds next to the old model
        fs::write(dir.path().join(MODEL_FILE), previous_model).unwrap();
        let err = ModelArtifacts::load(dir.path(), false).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::ArtifactUnavailable { ref path, .. } if path.ends_with(SCALER_FILE)
        ));
    }

    #[test]
    fn test_cluster_count_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut saved = artifacts();
        saved.metadata.n_clusters = 5;
        saved.save(dir.path()).unwrap();

        let err = ModelArtifacts::load(dir.path(), false).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::ArtifactUnavailable { ref path, .. } if path.ends_with(MODEL_FILE)
        ));
    }

    #[test]
    fn test_training_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(new_training_id(now), new_training_id(now));
    }

    #[test]
    fn test_write_atomically_keeps_previous_file_on_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "previous").unwrap();

        let result = write_atomically(&path, |writer| {
            writer.write_all(b"partial")?;
            Err(SegmentError::InvalidRequest("boom".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous");
        assert!(!dir.path().join("out.csv.tmp").exists());
    }
}
