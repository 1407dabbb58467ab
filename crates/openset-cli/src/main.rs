//! `openset` command line driver.
//!
//! # Commands
//!
//! - `openset run`: build a head from TOML and run a synthetic forward pass
//! - `openset probe`: resolve the feature width of catalog backbones
//!
//! Logging goes to stderr (`RUST_LOG`, default `info`); JSON results go to
//! stdout. Exit code 0 on success, 1 on error.

mod commands;

use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use commands::probe::{handle_probe, ProbeArgs};
use commands::run::{handle_run, RunArgs};

#[derive(Parser)]
#[command(name = "openset")]
#[command(about = "Open-set recognition head driver", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a head and run a forward pass over random images
    ///
    /// # Examples
    ///
    /// ```bash
    /// openset run --config head.toml --batch 10
    ///
    /// # With a calibrator and thresholds
    /// openset run --config head.toml --stats stats.json --thresholds 0.1,0.2,0.3
    /// ```
    Run(RunArgs),

    /// Print the resolved feature width of a catalog backbone
    ///
    /// # Examples
    ///
    /// ```bash
    /// openset probe --backbone ResNet18
    /// openset probe --all
    /// ```
    Probe(ProbeArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let code = match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::Probe(args) => handle_probe(args),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
