//! vigild - Vigil NVR daemon
//!
//! Startup proceeds in a fixed order:
//! 1. Resolve configuration (file, then VIGIL_* environment, then flags)
//! 2. Install the log pipeline before anything else logs
//! 3. Run a cleanup pass and start the recurring cleanup worker (non-fatal)
//! 4. Start the publisher worker on the outbound channel
//! 5. Start the detector worker on the detection channel
//! 6. Construct one capture worker per configured camera
//! 7. Connect to the MQTT broker (fatal on failure)
//! 8. Start the capture workers
//!
//! SIGTERM and Ctrl-C trigger the same shutdown: capture workers are
//! stopped and joined sequentially in creation order, then the process
//! exits 0.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use vigil_nvr::config::VigilConfig;
use vigil_nvr::logging::{self, parse_severity, StyleMode};
use vigil_nvr::orchestrator;

#[derive(Parser, Debug)]
#[command(author, version, about = "Vigil NVR daemon")]
struct Args {
    /// Path to the configuration file (defaults to vigil.toml if present).
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    /// (CRITICAL|ERROR|WARNING|INFO|DEBUG|NOTSET).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the log render style (auto|plain|overwrite).
    #[arg(long)]
    log_style: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = VigilConfig::load(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.log_level = parse_severity(level)?;
    }
    if let Some(style) = &args.log_style {
        config.log_style = StyleMode::parse(style)?;
    }

    logging::init(config.log_level, config.log_style)?;

    log::info!("vigild {} starting", env!("CARGO_PKG_VERSION"));
    for camera in &config.cameras {
        log::info!(
            "configured camera '{}': {} ({}x{} @ {} fps)",
            camera.name,
            camera.source,
            camera.width,
            camera.height,
            camera.fps
        );
    }

    orchestrator::run(config)
}
