//! Server configuration.
//!
//! One TOML file configures the engine's server, the handler threads that
//! answer calls, the in-process load client, and logging.

use grpc::{Code, ServerConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Engine server options
    #[serde(default)]
    pub server: ServerConfig,

    /// Handler thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// In-process load client
    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handler threads that loop on `request_call`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_threads")]
    pub threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
        }
    }
}

/// Load generated against the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    /// Total calls issued across all client threads
    #[serde(default = "default_calls")]
    pub calls: usize,

    /// Client threads, each with one call in flight
    #[serde(default = "default_client_threads")]
    pub threads: usize,

    /// Methods called round-robin
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    #[serde(default = "default_authority")]
    pub authority: String,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Status code handlers answer with
    #[serde(default = "default_response_code")]
    pub response_code: Code,

    #[serde(default)]
    pub response_message: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            calls: default_calls(),
            threads: default_client_threads(),
            methods: default_methods(),
            authority: default_authority(),
            deadline_ms: default_deadline_ms(),
            response_code: default_response_code(),
            response_message: String::new(),
        }
    }
}

impl LoadConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default)]
    pub thread_names: bool,

    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: false,
            target: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_worker_threads() -> usize {
    2
}

fn default_calls() -> usize {
    1000
}

fn default_client_threads() -> usize {
    4
}

fn default_methods() -> Vec<String> {
    vec!["/alpha".to_string(), "/beta".to_string()]
}

fn default_authority() -> String {
    "localhost".to_string()
}

fn default_deadline_ms() -> u64 {
    5000
}

fn default_response_code() -> Code {
    Code::Ok
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Config = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.workers.threads == 0 {
            return Err(ConfigError::Invalid(
                "workers.threads must be at least 1".to_string(),
            ));
        }
        if self.load.threads == 0 {
            return Err(ConfigError::Invalid(
                "load.threads must be at least 1".to_string(),
            ));
        }
        if self.load.methods.is_empty() {
            return Err(ConfigError::Invalid(
                "load.methods must name at least one method".to_string(),
            ));
        }
        if let Some(method) = self.load.methods.iter().find(|m| !m.starts_with('/')) {
            return Err(ConfigError::Invalid(format!(
                "method '{}' must start with '/'",
                method
            )));
        }
        Ok(())
    }
}
