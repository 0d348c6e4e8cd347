//! Command execution.
//!
//! Turns a parsed [`Command`] into the text sent back to the client.
//! Nothing here touches sockets, so every function is a plain
//! `&str -> String` transformation (apart from reading the clock and
//! file metadata).

use super::parser::Command;
use chrono::{DateTime, Utc};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Format used for every timestamp we emit.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub const QUIT_MESSAGE: &str = "Connection closed";
pub const FILE_NOT_FOUND: &str = "File not found";
pub const UNKNOWN_COMMAND: &str = "Unknown command";
pub const TIME_PREFIX: &str = "Current UTC time: ";

/// Parse and execute a request, always producing a response.
pub fn handle(input: &str) -> String {
    match Command::parse(input) {
        Ok(command) => execute(&command),
        Err(e) => e.to_string(),
    }
}

/// Execute a parsed command.
pub fn execute(command: &Command) -> String {
    match command {
        Command::Quit => QUIT_MESSAGE.to_string(),
        Command::Time => format!("{}{}", TIME_PREFIX, Utc::now().format(TIMESTAMP_FORMAT)),
        Command::Info => info(),
        Command::Find { name, dir } => find(name, dir),
        Command::Unknown => UNKNOWN_COMMAND.to_string(),
    }
}

fn info() -> String {
    format!(
        "System: {}, Server version: {}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    )
}

fn find(name: &str, dir: &str) -> String {
    let path = Path::new(dir).join(name);
    match std::fs::metadata(&path) {
        Ok(meta) => {
            // st_ctime: most Linux filesystems don't expose a birth time
            let created = DateTime::<Utc>::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "File: {}, Created: {}, Size: {} bytes",
                name,
                created,
                meta.len()
            )
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => FILE_NOT_FOUND.to_string(),
        Err(e) => format!("Error reading file: {}", e),
    }
}
