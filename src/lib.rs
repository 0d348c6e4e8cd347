//! command-server: a single-threaded TCP command server.
//!
//! One mio event loop multiplexes every client connection. Each read is
//! treated as a text command (`quit`, `time`, `info`, `find <name> <dir>`)
//! and answered with exactly one text response.

pub mod commands;
pub mod config;
pub mod runtime;
pub mod server;
pub mod signal;

pub use config::Config;
pub use server::Server;
