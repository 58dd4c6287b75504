//! agfield-gw CLI entry point.
//!
//! Loads a [`GatewayConfig`] from an optional TOML file plus environment
//! overrides, wires the composition root, and blocks until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use agfield_gw::config::GatewayConfig;
use agfield_gw::gateway::Gateway;

/// Agricultural field-bus (CAN/J1939/ISOBUS) ingestion and telemetry gateway.
#[derive(Parser, Debug)]
#[command(name = "agfield-gw", version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML). Missing file falls back to defaults
    /// plus environment overrides.
    #[arg(short, long, default_value = "agfield-gw.toml")]
    config: PathBuf,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    init_tracing(args.verbose);

    let rt = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    rt.block_on(run(args));
}

#[cfg(feature = "tracing-support")]
fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

#[cfg(not(feature = "tracing-support"))]
fn init_tracing(_verbose: bool) {}

async fn run(args: Args) {
    let config = if args.config.exists() {
        match GatewayConfig::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {:?}: {e}", args.config);
                std::process::exit(1);
            }
        }
    } else {
        eprintln!("no config file at {:?}, running off defaults + environment", args.config);
        GatewayConfig::from_env()
    };

    let gateway = match Gateway::build(config).await {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            eprintln!("failed to start gateway: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.start().await {
        eprintln!("failed to start receive loop: {e}");
        std::process::exit(1);
    }

    println!("agfield-gw running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    println!("shutting down...");

    gateway.shutdown().await;
}
