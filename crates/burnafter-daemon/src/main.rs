//! burnafter-daemon - Main entry point.
//!
//! This binary is designed to be embedded in the client library and spawned
//! as a detached daemon process. It accepts a single positional argument:
//! the JSON serialization of its configuration. Missing keys take defaults,
//! and `BURNAFTER_SOCKET_PATH` / `BURNAFTER_DEBUG` (or whatever variable
//! names the configuration carries) override the socket path and debug flag
//! at startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burnafter_core::config::Config;
use burnafter_daemon::{storage, Daemon};

/// Ephemeral secret-store daemon, one instance per client executable.
#[derive(Parser)]
#[command(name = "burnafter-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration as a single JSON object (keys: socket_path,
    /// default_ttl, inactivity_timeout, debug, envar_socket, envar_debug,
    /// max_secrets, max_secret_size)
    config: Option<String>,
}

fn setup_logging(debug: bool) {
    // Quiet unless debugging; RUST_LOG overrides either way.
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(arg) => Config::from_arg(arg).context("Failed to parse configuration argument")?,
        None => Config::default(),
    };
    config.apply_env();

    setup_logging(config.debug);
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting burnafter daemon"
    );

    let backend = storage::default_backend();
    let daemon = Arc::new(Daemon::new(config, backend).context("Failed to create daemon")?);

    daemon.run().await.context("Daemon error")?;
    Ok(())
}
