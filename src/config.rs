//! Configuration module for the grow-a-server demo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::connection::{timeout_from_secs, ConnectionKind};
use crate::runtime::dispatcher::ExchangeConfig;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "grow-a-server")]
#[command(author = "grow-a-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A pooled echo server over TCP or UDP", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7070)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Transport protocol
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Socket I/O mode for stream connections
    #[arg(long, value_enum)]
    pub io_mode: Option<IoMode>,

    /// Listen backlog for stream transports
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Transport protocol served by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

/// How stream sockets are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Readiness-driven async sockets
    #[default]
    Native,
    /// Blocking sockets run on the blocking thread pool
    Blocking,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BuffersConfig,
    #[serde(default)]
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub io_mode: IoMode,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            transport: TransportKind::default(),
            io_mode: IoMode::default(),
            backlog: default_backlog(),
            workers: None,
        }
    }
}

/// Buffer pool configuration
#[derive(Debug, Deserialize)]
pub struct BuffersConfig {
    /// Capacity of each pooled buffer in bytes
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    /// Idle buffers kept for reuse
    #[serde(default = "default_buffer_pool_size")]
    pub pool_size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            pool_size: default_buffer_pool_size(),
        }
    }
}

/// Exchange pool configuration
#[derive(Debug, Deserialize)]
pub struct ExchangeSection {
    /// Idle request/response pairs kept for reuse
    #[serde(default = "default_exchange_pool_size")]
    pub pool_size: usize,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            pool_size: default_exchange_pool_size(),
        }
    }
}

/// Per-direction I/O timeouts in seconds (0 = none)
#[derive(Debug, Deserialize, Default)]
pub struct TimeoutsConfig {
    #[serde(default)]
    pub read: i64,
    #[serde(default)]
    pub write: i64,
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
    "127.0.0.1:7070".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_buffer_capacity() -> usize {
    4096
}

fn default_buffer_pool_size() -> usize {
    1024
}

fn default_exchange_pool_size() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub transport: TransportKind,
    pub io_mode: IoMode,
    pub backlog: u32,
    pub workers: usize,
    pub buffer_capacity: usize,
    pub buffer_pool_size: usize,
    pub exchange_pool_size: usize,
    pub read_timeout_secs: i64,
    pub write_timeout_secs: i64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        if toml_config.buffers.capacity == 0 {
            return Err(ConfigError::Invalid("buffers.capacity must be positive"));
        }

        let workers = cli
            .workers
            .or(toml_config.server.workers)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
        if workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive"));
        }

        Ok(Config {
            listen,
            transport: cli.transport.unwrap_or(toml_config.server.transport),
            io_mode: cli.io_mode.unwrap_or(toml_config.server.io_mode),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers,
            buffer_capacity: toml_config.buffers.capacity,
            buffer_pool_size: toml_config.buffers.pool_size,
            exchange_pool_size: toml_config.exchange.pool_size,
            read_timeout_secs: toml_config.timeouts.read,
            write_timeout_secs: toml_config.timeouts.write,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Connection variant the listener produces.
    pub fn connection_kind(&self) -> ConnectionKind {
        match (self.transport, self.io_mode) {
            (TransportKind::Udp, _) => ConnectionKind::Datagram,
            (TransportKind::Tcp, IoMode::Native) => ConnectionKind::NativeStream,
            (TransportKind::Tcp, IoMode::Blocking) => ConnectionKind::BlockingStream,
        }
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            read_timeout: timeout_from_secs(self.read_timeout_secs),
            write_timeout: timeout_from_secs(self.write_timeout_secs),
            pool_size: self.exchange_pool_size,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, AddrParseError),
    Invalid(&'static str),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{addr}': {e}")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("grow-a-server").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7070");
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.transport, TransportKind::Tcp);
        assert_eq!(config.buffers.capacity, 4096);
        assert_eq!(config.exchange.pool_size, 256);
        assert_eq!(config.timeouts.read, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            transport = "udp"
            io_mode = "blocking"
            workers = 4

            [buffers]
            capacity = 8192

            [timeouts]
            read = 30
            write = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.transport, TransportKind::Udp);
        assert_eq!(config.server.io_mode, IoMode::Blocking);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.buffers.capacity, 8192);
        assert_eq!(config.buffers.pool_size, 1024);
        assert_eq!(config.timeouts.read, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [timeouts]
            read = 10

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--listen", "127.0.0.1:9100", "--io-mode", "blocking", "-w", "2"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.workers, 2);
        assert_eq!(config.connection_kind(), ConnectionKind::BlockingStream);
        assert_eq!(config.log_level, "warn");

        let exchange = config.exchange_config();
        assert_eq!(exchange.read_timeout, Some(Duration::from_secs(10)));
        assert_eq!(exchange.write_timeout, None);
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(cli(&["--listen", "nowhere"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen(..)));

        let toml_config: TomlConfig = toml::from_str("[buffers]\ncapacity = 0").unwrap();
        let err = Config::merge(cli(&[]), toml_config).unwrap_err();
        assert!(err.to_string().contains("buffers.capacity"));
    }

    #[test]
    fn test_udp_ignores_io_mode() {
        let config = Config::merge(
            cli(&["--transport", "udp", "--io-mode", "native"]),
            TomlConfig::default(),
        )
        .unwrap();
        assert_eq!(config.connection_kind(), ConnectionKind::Datagram);
    }
}
