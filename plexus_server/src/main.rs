//! # Plexus Device Server Binary
//!
//! Loads a TOML configuration, binds the configured drivers and serves
//! clients over TCP until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with a config file
//! plexus --config config/plexus.toml
//!
//! # Override the port, verbose logging
//! plexus --config config/plexus.toml --port 7000 -v
//!
//! # JSON logs
//! plexus --config config/plexus.toml --json
//! ```

use clap::Parser;
use plexus_server::{DriverRegistry, ServerCore};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// Plexus - device server with pluggable drivers
#[derive(Parser, Debug)]
#[command(name = "plexus")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Device server with pluggable drivers")]
#[command(long_about = None)]
struct Args {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "/etc/plexus/plexus.toml")]
    config: PathBuf,

    /// Override the TCP port from the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("Plexus startup failed: {}", e);
        eprintln!("plexus: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ServerCore::load_config(&args.config)?;
    setup_tracing(&args, config.server.log_level.into());

    info!("Plexus v{} starting...", env!("CARGO_PKG_VERSION"));
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let drivers = DriverRegistry::with_builtin();
    info!("Available drivers: {:?}", drivers.list_drivers());

    let mut core = ServerCore::new(config, drivers)?;
    core.init()?;

    // Setup signal handler.
    let running = core.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    if let Err(e) = core.run() {
        error!("Accept loop error: {}", e);
    }
    core.shutdown()?;

    info!("Plexus shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and configured level.
fn setup_tracing(args: &Args, configured: Level) {
    let level = if args.verbose {
        configured.max(Level::DEBUG)
    } else {
        configured
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
