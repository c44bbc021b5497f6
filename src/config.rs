//! Configuration module for the http_echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With no arguments
//! at all the server binds two ephemeral ports on 127.0.0.1.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::protocols::http::{ConnectionConfig, FrameLimits};

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "http_echo")]
#[command(version = "0.1.0")]
#[command(about = "An HTTP/1.1 echo server with an admin shutdown port", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address both listeners bind to
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP port (0 picks an ephemeral port)
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Admin port (0 picks an ephemeral port)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Ports to try in order when a port is 0 (e.g. 49152-65535)
    #[arg(long)]
    pub port_range: Option<PortRange>,

    /// Listen backlog for both sockets
    #[arg(long)]
    pub backlog: Option<u32>,

    /// I/O runtime
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of worker threads for the tokio runtime (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent HTTP connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Grace period for flushing responses after shutdown, in milliseconds
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Largest accepted request head in bytes
    #[arg(long)]
    pub max_head_size: Option<usize>,

    /// Largest accepted request body in bytes (unbounded when unset)
    #[arg(long)]
    pub max_body_size: Option<u64>,

    /// Queued response bytes per connection before reading pauses
    #[arg(long)]
    pub max_pending_bytes: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// I/O runtime used to drive the listeners and connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// One tokio task per connection
    #[default]
    Tokio,
    /// Single-threaded mio event loop (epoll/kqueue)
    Mio,
}

/// Inclusive range of ports, written `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid {
            field: "port_range",
            reason: format!("expected `start-end`, got `{s}`"),
        };

        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;
        if start == 0 || start > end {
            return Err(invalid());
        }
        Ok(PortRange { start, end })
    }
}

impl TryFrom<String> for PortRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and runtime configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub admin_port: u16,
    pub port_range: Option<PortRange>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub runtime: RuntimeType,
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: 0,
            admin_port: 0,
            port_range: None,
            backlog: default_backlog(),
            runtime: RuntimeType::default(),
            workers: None,
            max_connections: default_max_connections(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Request framing configuration
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_head_size")]
    pub max_head_size: usize,
    pub max_body_size: Option<u64>,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_head_size: default_max_head_size(),
            max_body_size: None,
            max_pending_bytes: default_max_pending_bytes(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> u32 {
    128
}

fn default_max_connections() -> usize {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_max_head_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_pending_bytes() -> usize {
    8 * 1024 * 1024 // 8 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub http_port: u16,
    pub admin_port: u16,
    pub port_range: Option<PortRange>,
    pub backlog: u32,
    pub runtime: RuntimeType,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub max_head_size: usize,
    pub max_body_size: Option<u64>,
    pub max_pending_bytes: usize,
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
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Self::resolve(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            http,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            http_port: cli.http_port.unwrap_or(server.http_port),
            admin_port: cli.admin_port.unwrap_or(server.admin_port),
            port_range: cli.port_range.or(server.port_range),
            backlog: cli.backlog.unwrap_or(server.backlog),
            runtime: cli.runtime.unwrap_or(server.runtime),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            drain_timeout: Duration::from_millis(
                cli.drain_timeout_ms.unwrap_or(server.drain_timeout_ms),
            ),
            max_head_size: cli.max_head_size.unwrap_or(http.max_head_size),
            max_body_size: cli.max_body_size.or(http.max_body_size),
            max_pending_bytes: cli.max_pending_bytes.unwrap_or(http.max_pending_bytes),
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backlog", self.backlog as usize),
            ("max_connections", self.max_connections),
            ("max_head_size", self.max_head_size),
            ("max_pending_bytes", self.max_pending_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if u32::try_from(self.max_connections).is_err() {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: format!("must be at most {}", u32::MAX),
            });
        }

        if self.workers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.http_port != 0 && self.http_port == self.admin_port {
            return Err(ConfigError::Invalid {
                field: "admin_port",
                reason: format!("must differ from http_port ({})", self.http_port),
            });
        }

        Ok(())
    }

    /// Drain grace period in whole milliseconds, saturating.
    pub fn drain_timeout_ms(&self) -> u64 {
        u64::try_from(self.drain_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_head_size: self.max_head_size,
            max_body_size: self.max_body_size,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            limits: self.frame_limits(),
            max_pending_bytes: self.max_pending_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default(), TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
