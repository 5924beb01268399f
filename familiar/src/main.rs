//! # Familiar
//!
//! Operator front end for the remote processor offload bridge.
//!
//! ## Features
//!
//! - **Self-test**: Drive a full session lifecycle against the in-process
//!   loopback remote processor, crash and recovery included
//! - **Configuration**: Print the effective bridge configuration

mod selftest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libnyx_offload::config::CONFIG_FILE;
use libnyx_offload::OffloadConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Familiar - Offload bridge
#[derive(Parser, Debug)]
#[command(name = "familiar", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "FAMILIAR_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Exercise the bridge against the loopback remote processor
    Selftest {
        /// Remote endpoint name to register
        #[arg(short, long, default_value = "rpmsg-omx0")]
        service: String,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

/// `RUST_LOG` directives win; otherwise `--debug` picks the level
fn log_filter(directives: Option<String>, debug: bool) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(if debug { "debug" } else { "info" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            std::env::var(EnvFilter::DEFAULT_ENV).ok(),
            args.debug,
        ))
        .init();

    info!("Familiar v{} starting", env!("CARGO_PKG_VERSION"));

    let config = OffloadConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command.unwrap_or(Commands::Selftest {
        service: "rpmsg-omx0".into(),
        json: false,
    }) {
        Commands::Selftest { service, json } => {
            let report = selftest::run(config, &service).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
            if !report.passed() {
                anyhow::bail!("self-test failed");
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}
