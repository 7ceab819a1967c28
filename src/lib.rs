//! rfmforge: customer segmentation on RFM (Recency, Frequency, Monetary) features
//!
//! The offline side derives per-customer features from transaction logs and
//! fits a standardization plus a K-Means partition model. The online side
//! applies those frozen artifacts to single RFM triples: log transform, clamp
//! to the training range, standardize, then assign the nearest centroid and
//! its segment label.

pub mod artifacts;
pub mod bounds;
pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod predict;
pub mod scaler;
pub mod segment;
pub mod serve;
pub mod train;

// Re-export public items for easier access
pub use artifacts::{ModelArtifacts, ModelMetadata};
pub use bounds::TrainingBounds;
pub use config::Config;
pub use error::{Result, SegmentError};
pub use features::{
    derive_features, load_features, load_transactions, save_features, CustomerFeatureVector,
    TransactionRecord,
};
pub use scaler::NormalizationParams;
pub use segment::{PartitionModel, SegmentAssigner, SegmentLabelMap, UNKNOWN_SEGMENT};
pub use serve::{SegmentReply, SegmentRequest, SegmentResponse, SegmentService, Segmenter};
pub use train::{train, train_and_save, TrainedModel, TrainerConfig, TrainingReport};
