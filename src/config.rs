//! Configuration module for the command server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the command server
#[derive(Parser, Debug)]
#[command(name = "command-server")]
#[command(author = "command-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP command server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog depth
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Maximum bytes read per command
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Upper bound on a single poll, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Number of readiness events fetched per poll
    #[arg(long)]
    pub events_capacity: Option<usize>,

    /// SO_SNDBUF for accepted connections (OS default if unset)
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            read_chunk_size: default_read_chunk_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
            send_buffer_size: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_read_chunk_size() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub read_chunk_size: usize,
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub send_buffer_size: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            backlog: server.backlog,
            read_chunk_size: server.read_chunk_size,
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            events_capacity: server.events_capacity,
            send_buffer_size: server.send_buffer_size,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        Ok(Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            read_chunk_size: cli
                .read_chunk_size
                .unwrap_or(toml_config.server.read_chunk_size)
                .max(1),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.server.poll_timeout_ms),
            ),
            events_capacity: cli
                .events_capacity
                .unwrap_or(toml_config.server.events_capacity)
                .max(1),
            send_buffer_size: cli.send_buffer_size.or(toml_config.server.send_buffer_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}'", addr)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:8000");
        assert_eq!(config.server.read_chunk_size, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            backlog = 16
            read_chunk_size = 512

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.backlog, 16);
        assert_eq!(config.server.read_chunk_size, 512);
        assert_eq!(config.server.poll_timeout_ms, 500);
        assert_eq!(config.server.send_buffer_size, None);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliArgs::parse_from([
            "command-server",
            "--listen",
            "127.0.0.1:7000",
            "--read-chunk-size",
            "64",
            "--log-level",
            "debug",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.read_chunk_size, 64);
        assert_eq!(config.backlog, 128);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_send_buffer_size_cli_over_toml() {
        let path = std::env::temp_dir().join(format!(
            "command-server-sndbuf-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[server]\nsend_buffer_size = 8192\n").unwrap();
        let path_arg = path.to_str().unwrap();

        let cli = CliArgs::parse_from(["command-server", "--config", path_arg]);
        assert_eq!(Config::from_cli(cli).unwrap().send_buffer_size, Some(8192));

        let cli = CliArgs::parse_from([
            "command-server",
            "--config",
            path_arg,
            "--send-buffer-size",
            "4096",
        ]);
        assert_eq!(Config::from_cli(cli).unwrap().send_buffer_size, Some(4096));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_invalid_listen_address() {
        let cli = CliArgs::parse_from(["command-server", "--listen", "not-an-address"]);
        match Config::from_cli(cli) {
            Err(ConfigError::InvalidListen(addr)) => assert_eq!(addr, "not-an-address"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
