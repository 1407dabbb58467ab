//! Backbone width probe command

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use openset_head::{probe, BackboneKind};
use serde_json::{json, Value};
use tracing::{error, info};

/// Arguments for the probe command.
#[derive(Args)]
pub struct ProbeArgs {
    /// Catalog backbone name (LeNetPlus, LeNetGAP, ResNet8, ResNet18, ResNet34)
    #[arg(short, long, default_value = "ResNet18", conflicts_with = "all")]
    pub backbone: String,

    /// Probe every catalog backbone
    #[arg(long)]
    pub all: bool,

    /// Image channels the backbone is built for
    #[arg(long, default_value = "3")]
    pub input_channels: usize,
}

/// Handle the probe command.
pub fn handle_probe(args: ProbeArgs) -> i32 {
    let result = if args.all {
        BackboneKind::ALL
            .into_iter()
            .map(|kind| probe_one(kind, args.input_channels))
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Value::Array)
    } else {
        args.backbone
            .parse::<BackboneKind>()
            .context("Invalid --backbone")
            .and_then(|kind| probe_one(kind, args.input_channels))
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            0
        }
        Err(e) => {
            error!("Probe failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

/// Build `kind` with throwaway parameters and resolve its feature width.
pub fn probe_one(kind: BackboneKind, input_channels: usize) -> anyhow::Result<Value> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backbone = kind
        .build(input_channels, vb)
        .with_context(|| format!("Failed to build backbone {}", kind))?;
    let feat_dim = probe::output_dim(backbone.as_ref())?;
    info!(backbone = kind.as_str(), feat_dim, "Probed backbone");

    Ok(json!({
        "backbone": kind.as_str(),
        "feat_dim": feat_dim,
        "declared": backbone.declared_output_dim().is_some(),
    }))
}
