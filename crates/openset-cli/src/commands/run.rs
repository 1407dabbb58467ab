//! Synthetic forward pass command

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{Device, Tensor};
use clap::Args;
use openset_head::{CalibrationStats, GaussianCalibrator, HeadConfig, OpenSetHead};
use serde_json::{json, Value};
use tracing::{error, info};

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Head configuration (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Calibration statistics (JSON); attaches a Gaussian calibrator
    #[arg(long)]
    pub stats: Option<PathBuf>,

    /// Comma separated decision thresholds
    #[arg(long, value_delimiter = ',')]
    pub thresholds: Option<Vec<f32>>,

    /// Number of random images
    #[arg(long, default_value = "10")]
    pub batch: usize,

    /// Image height
    #[arg(long, default_value = "32")]
    pub height: usize,

    /// Image width
    #[arg(long, default_value = "32")]
    pub width: usize,

    /// Run the backbone with batch statistics
    #[arg(long)]
    pub train: bool,
}

/// Handle the run command.
pub fn handle_run(args: RunArgs) -> i32 {
    match run(&args) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            0
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

/// Build the head described by `args` and summarize one forward pass.
pub fn run(args: &RunArgs) -> anyhow::Result<Value> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            HeadConfig::from_file(path)?
        }
        None => {
            info!("Using default configuration");
            HeadConfig::default()
        }
    }
    .with_env_overrides()
    .context("Invalid OPENSET_* override")?;
    config.validate()?;

    let device = Device::Cpu;
    let mut builder = OpenSetHead::builder(config);
    if let Some(path) = &args.stats {
        let stats = CalibrationStats::from_file(path)?;
        builder = builder.with_calibrator(Box::new(GaussianCalibrator::from_stats(stats)?));
    }
    if let Some(values) = &args.thresholds {
        builder = builder.with_thresholds(Tensor::from_slice(values.as_slice(), values.len(), &device)?);
    }
    let head = builder.build(&device).context("Failed to build open-set head")?;

    let channels = head.config().input_channels;
    let images = Tensor::rand(0f32, 1f32, (args.batch, channels, args.height, args.width), &device)?;
    let record = head
        .forward_t(&images, args.train)
        .context("Forward pass failed")?;
    info!(
        batch = args.batch,
        feat_dim = head.feat_dim(),
        embed_dim = head.embed_dim(),
        calibrated = head.is_calibrated(),
        "Forward pass complete"
    );

    Ok(json!({
        "backbone": head.backbone().name(),
        "feat_dim": head.feat_dim(),
        "embed_dim": head.embed_dim(),
        "num_classes": head.config().num_classes,
        "record": record.summary(),
    }))
}
