//! rfmforge: RFM customer segmentation CLI
//!
//! Orchestrates feature derivation, model training, batch scoring and
//! single-customer prediction.

use anyhow::{Context, Result};
use clap::Parser;
use rfmforge::cli::{parse_rfm_values, Args, Command};
use rfmforge::{
    derive_features, load_features, load_transactions, predict, save_features, train_and_save,
    Config, SegmentLabelMap, SegmentService, Segmenter,
};
use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.command.apply_overrides(&mut config);
    config.validate()?;

    if args.verbose {
        println!("rfmforge - Customer Segmentation using RFM and K-Means");
        println!("======================================================\n");
    }

    match &args.command {
        Command::Features { .. } => run_features(&args, &config).map(|_| ()),
        Command::Train { .. } => run_train(&args, &config),
        Command::Predict { .. } => run_predict(&args, &config),
        Command::Segment { rfm, stdin, .. } => run_segment(&config, rfm.as_deref(), *stdin),
        Command::Run { .. } => run_full_pipeline(&args, &config),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "rfmforge=debug" } else { "rfmforge=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Derive RFM features from raw transactions
fn run_features(args: &Args, config: &Config) -> Result<usize> {
    let paths = &config.paths;
    if args.verbose {
        println!("Loading transactions from: {}", paths.transactions.display());
    }

    let start_time = Instant::now();
    let transactions = load_transactions(&paths.transactions)
        .with_context(|| format!("Failed to load {}", paths.transactions.display()))?;
    let features = derive_features(&transactions);
    save_features(&paths.features, &features)?;

    println!(
        "✓ Features derived: {} customers from {} transactions",
        features.len(),
        transactions.len()
    );
    if args.verbose {
        println!("  Output file: {}", paths.features.display());
        println!("  Processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    }

    Ok(features.len())
}

/// Fit scaler, K-Means and bounds, then persist them
fn run_train(args: &Args, config: &Config) -> Result<()> {
    let paths = &config.paths;
    let trainer_config = config.trainer_config();

    if args.verbose {
        println!("Loading features from: {}", paths.features.display());
        println!("  Number of clusters: {}", trainer_config.n_clusters);
        println!("  Max iterations: {}", trainer_config.max_iterations);
        println!("  Seed: {}", trainer_config.seed);
    }

    let start_time = Instant::now();
    let features = load_features(&paths.features)
        .with_context(|| format!("Failed to load {}", paths.features.display()))?;
    let trained = train_and_save(&features, &trainer_config, &paths.models_dir)
        .with_context(|| format!("Training into {} failed", paths.models_dir.display()))?;

    println!("✓ Model fitted successfully");
    println!("\n=== Cluster Statistics ===");
    let labels = SegmentLabelMap::default();
    let report = &trained.report;
    for (cluster, &size) in report.cluster_sizes.iter().enumerate() {
        let percentage = (size as f64 / report.n_customers as f64) * 100.0;
        println!(
            "Cluster {} ({}): {} customers ({:.1}%)",
            cluster,
            labels.label(cluster),
            size,
            percentage
        );
    }
    println!("\nSilhouette score (sample): {:.3}", report.silhouette);
    println!("Within-cluster sum of squares: {:.2}", report.inertia);

    if args.verbose {
        for (cluster, centroid) in trained.model.centroids().outer_iter().enumerate() {
            println!(
                "  Centroid {} (normalized): R={:.2}, F={:.2}, M={:.2}",
                cluster, centroid[0], centroid[1], centroid[2]
            );
        }
        println!("  Artifacts saved to: {}", paths.models_dir.display());
        println!("  Training time: {:.2}s", start_time.elapsed().as_secs_f64());
    }

    Ok(())
}

/// Score every customer in the features file
fn run_predict(args: &Args, config: &Config) -> Result<()> {
    let paths = &config.paths;
    let start_time = Instant::now();

    let segmenter = Segmenter::load(
        &paths.models_dir,
        SegmentLabelMap::default(),
        config.serving.require_bounds,
    )
    .context("Ensure the features and train steps have been run")?;
    let features = load_features(&paths.features)
        .with_context(|| format!("Failed to load {}", paths.features.display()))?;

    let scored = predict::score_customers(&features, &segmenter);
    predict::save_segments(&paths.segments, &scored)?;

    println!("✓ Segmented {} customers", scored.len());
    for (segment, count) in predict::segment_counts(&scored) {
        println!("  {segment}: {count}");
    }
    if args.verbose {
        println!("  Output file: {}", paths.segments.display());
        println!("  Processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    }

    Ok(())
}

/// Answer one request from the command line, or JSON lines from stdin
fn run_segment(config: &Config, rfm: Option<&str>, from_stdin: bool) -> Result<()> {
    let service = SegmentService::initialize(
        &config.paths.models_dir,
        SegmentLabelMap::default(),
        config.serving.require_bounds,
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if from_stdin {
        for line in io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let reply = service.handle_json(&line);
            writeln!(out, "{}", serde_json::to_string(&reply)?)?;
        }
        return Ok(());
    }

    let Some(rfm) = rfm else {
        anyhow::bail!("Provide --rfm \"recency,frequency,monetary\" or --stdin");
    };
    let request = parse_rfm_values(rfm)?;
    let reply = service.handle(&request);
    writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;

    Ok(())
}

/// Run features, training and batch scoring in sequence
fn run_full_pipeline(args: &Args, config: &Config) -> Result<()> {
    println!("=== Full Segmentation Pipeline ===\n");
    let start_time = Instant::now();

    let customers = run_features(args, config)?;
    if customers == 0 {
        anyhow::bail!("No customers left after filtering; nothing to train on");
    }
    println!();
    run_train(args, config)?;
    println!();
    run_predict(args, config)?;

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    println!("Segments saved to: {}", config.paths.segments.display());

    Ok(())
}
