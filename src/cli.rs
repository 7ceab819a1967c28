//! Command-line interface definitions and argument parsing

use crate::config::Config;
use crate::serve::SegmentRequest;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// RFM customer segmentation: derive features, train K-Means, predict segments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a TOML configuration file (defaults to ./rfmforge.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Derive per-customer RFM features from a transactions CSV
    Features {
        /// Transactions CSV
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Output features CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit the scaler, the K-Means model and the training bounds
    Train {
        /// Features CSV produced by `features`
        #[arg(short, long)]
        features: Option<PathBuf>,
        /// Directory receiving the model artifacts
        #[arg(short, long)]
        models_dir: Option<PathBuf>,
        /// Number of clusters for K-Means
        #[arg(short = 'k', long)]
        clusters: Option<usize>,
        /// Seed for centroid initialization
        #[arg(long)]
        seed: Option<u64>,
        /// Maximum iterations for K-Means algorithm
        #[arg(long)]
        max_iters: Option<u64>,
    },

    /// Score every customer in a features CSV and write the segment report
    Predict {
        #[arg(short, long)]
        features: Option<PathBuf>,
        #[arg(short, long)]
        models_dir: Option<PathBuf>,
        /// Output segments CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Predict the segment of a single customer
    Segment {
        /// RFM values as comma-separated string
        /// Example: --rfm "15,2,350.75" for Recency=15, Frequency=2, Monetary=350.75
        #[arg(short, long, conflicts_with = "stdin")]
        rfm: Option<String>,
        /// Read one JSON request per line from stdin
        #[arg(long)]
        stdin: bool,
        #[arg(short, long)]
        models_dir: Option<PathBuf>,
    },

    /// Run features, train and predict in sequence
    Run {
        /// Transactions CSV
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

impl Command {
    /// Fold command-line overrides into the loaded configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        match self {
            Command::Features { input, output } => {
                override_path(&mut config.paths.transactions, input);
                override_path(&mut config.paths.features, output);
            }
            Command::Train {
                features,
                models_dir,
                clusters,
                seed,
                max_iters,
            } => {
                override_path(&mut config.paths.features, features);
                override_path(&mut config.paths.models_dir, models_dir);
                if let Some(clusters) = clusters {
                    config.training.n_clusters = *clusters;
                }
                if let Some(seed) = seed {
                    config.training.seed = *seed;
                }
                if let Some(max_iters) = max_iters {
                    config.training.max_iterations = *max_iters;
                }
            }
            Command::Predict {
                features,
                models_dir,
                output,
            } => {
                override_path(&mut config.paths.features, features);
                override_path(&mut config.paths.models_dir, models_dir);
                override_path(&mut config.paths.segments, output);
            }
            Command::Segment { models_dir, .. } => {
                override_path(&mut config.paths.models_dir, models_dir);
            }
            Command::Run { input } => {
                override_path(&mut config.paths.transactions, input);
            }
        }
    }
}

fn override_path(target: &mut PathBuf, value: &Option<PathBuf>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

/// Parse RFM values from the predict string
/// Expected format: "recency,frequency,monetary"
pub fn parse_rfm_values(input: &str) -> anyhow::Result<SegmentRequest> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 3 {
        anyhow::bail!("RFM values must be in format 'recency,frequency,monetary'");
    }

    let recency: u64 = parts[0]
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid recency value: {}", parts[0]))?;
    let frequency: u64 = parts[1]
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid frequency value: {}", parts[1]))?;
    let monetary: f64 = parts[2]
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid monetary value: {}", parts[2]))?;

    if !monetary.is_finite() || monetary < 0.0 {
        anyhow::bail!("Monetary value must be a non-negative number: {}", parts[2]);
    }

    Ok(SegmentRequest {
        recency,
        frequency,
        monetary,
    })
}
