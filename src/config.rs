//! Configuration module for the nexus-httpd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ListenAddr;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// I/O backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// io_uring completion queue (Linux only)
    Uring,
    /// Readiness events from epoll/kqueue adapted to completions
    Mio,
    /// Tokio tasks, one per connection
    Tokio,
}

impl Default for RuntimeType {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            RuntimeType::Uring
        } else {
            RuntimeType::Mio
        }
    }
}

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "nexus-httpd")]
#[command(version)]
#[command(about = "A completion-driven HTTP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (host:port, or unix:/path for a local socket)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// I/O backend
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// io_uring submission queue entries per worker
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Maximum connections per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Read buffer size per connection (caps the request size)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Response body served at /
    #[arg(long)]
    pub body: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub runtime: RuntimeType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            backlog: default_backlog(),
            runtime: RuntimeType::default(),
        }
    }
}

/// Engine tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Completions gathered per turn
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush-and-retry attempts on a full submission queue
    #[serde(default = "default_submit_retries")]
    pub submit_retries: usize,
    /// Bound on a single wait; 0 waits without a timeout
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            submit_retries: default_submit_retries(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// Response configuration
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            body: default_body(),
            content_type: default_content_type(),
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
    "127.0.0.1:8080".to_string()
}

fn default_backlog() -> i32 {
    8192
}

fn default_ring_size() -> u32 {
    4096
}

fn default_max_connections() -> usize {
    4096
}

fn default_buffer_size() -> usize {
    4096
}

fn default_batch_size() -> usize {
    256
}

fn default_submit_retries() -> usize {
    8
}

fn default_wait_timeout_ms() -> u64 {
    100
}

fn default_body() -> String {
    "Hello World!".to_string()
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: ListenAddr,
    /// Worker threads; 0 means one per CPU
    pub workers: usize,
    pub backlog: i32,
    pub runtime: RuntimeType,
    pub ring_size: u32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub submit_retries: usize,
    pub wait_timeout_ms: u64,
    pub body: String,
    pub content_type: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments against the config file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<ListenAddr>()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        let config = Config {
            listen,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            ring_size: cli.ring_size.unwrap_or(toml_config.runtime.ring_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.runtime.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            batch_size: toml_config.runtime.batch_size,
            submit_retries: toml_config.runtime.submit_retries,
            wait_timeout_ms: toml_config.runtime.wait_timeout_ms,
            body: cli.body.unwrap_or(toml_config.http.body),
            content_type: toml_config.http.content_type,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes the engine cannot serve with.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size", "must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections", "must be at least 1".into()));
        }
        if self.ring_size == 0 {
            return Err(ConfigError::Invalid("ring_size", "must be at least 1".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(
                "backlog",
                format!("must be positive, got {}", self.backlog),
            ));
        }
        Ok(())
    }

    /// Number of worker threads to start.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        let runtime = RuntimeConfig::default();
        let http = HttpConfig::default();
        Self {
            listen: ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 8080))),
            workers: server.workers,
            backlog: server.backlog,
            runtime: server.runtime,
            ring_size: runtime.ring_size,
            max_connections: runtime.max_connections,
            buffer_size: runtime.buffer_size,
            batch_size: runtime.batch_size,
            submit_retries: runtime.submit_retries,
            wait_timeout_ms: runtime.wait_timeout_ms,
            body: http.body,
            content_type: http.content_type,
            log_level: default_log_level(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, String),
    Invalid(&'static str, String),
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
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
