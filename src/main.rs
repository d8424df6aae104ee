//! nexus-httpd: a completion-driven HTTP server
//!
//! Serves a fixed response and a small JSON API to many concurrent
//! connections from one of three backends:
//! - io_uring completion queue (Linux)
//! - mio readiness adapted to completions (Linux/macOS)
//! - Tokio tasks
//!
//! Configuration via CLI arguments or TOML file.

use nexus_httpd::config::Config;
use nexus_httpd::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        workers = config.worker_count(),
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "Starting nexus-httpd server"
    );

    runtime::run(config)?;
    Ok(())
}
