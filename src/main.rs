//! command-server: single-threaded TCP command server.
//!
//! Features:
//! - One mio event loop multiplexing every connection
//! - Commands: quit, time, info, find <name> <dir>
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

use command_server::signal::install_signal_handler;
use command_server::{Config, Server};
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
        read_chunk_size = config.read_chunk_size,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        "Starting command-server"
    );

    let mut server = Server::bind(&config)?;
    install_signal_handler(server.stop_handle())?;
    server.run()?;

    Ok(())
}
