//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM ask the event loop to stop. A second signal while
//! the loop is still winding down exits immediately.

use crate::runtime::StopHandle;

/// Install signal handlers that stop the loop behind `stop`.
pub fn install_signal_handler(stop: StopHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        // Check if we've already received a signal
        if stop.stop() {
            tracing::warn!("Received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("Received shutdown signal, initiating graceful shutdown...");
    })
}
