//! TOML Configuration File Support
//!
//! Centralized configuration for a relay, loaded from
//! `$XDG_CONFIG_HOME/relay/relay.toml` (typically `~/.config/relay/relay.toml`).
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [session]
//! timeout_secs = 30
//! max_concurrent_sessions = 16
//! channel_capacity = 1
//!
//! [request]
//! max_content_length = 32768
//! max_session_id_length = 128
//!
//! [transport]
//! socket_path = "/run/user/1000/relay/relay.sock"
//! max_frame_size = 1048576
//!
//! [pipeline]
//! kind = "ollama"
//! ollama_host = "localhost"
//! ollama_port = 11434
//! model = "llama3.2"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::MAX_FRAME_SIZE;
use crate::manager::StreamManagerConfig;
use crate::pipeline::{DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT};
use crate::request::RequestLimits;
use crate::supervisor::{DEFAULT_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT};

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "llama3.2";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the winning configuration layer came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Session ceiling in seconds
    pub timeout_secs: Option<u64>,
    /// Maximum sessions streaming at once
    pub max_concurrent_sessions: Option<usize>,
    /// Pipeline channel capacity
    pub channel_capacity: Option<usize>,
}

/// `[request]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestToml {
    /// Maximum content length in characters
    pub max_content_length: Option<usize>,
    /// Maximum session id length in bytes
    pub max_session_id_length: Option<usize>,
}

/// `[transport]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Unix socket path
    pub socket_path: Option<String>,
    /// Maximum frame size in bytes
    pub max_frame_size: Option<usize>,
}

/// `[pipeline]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineToml {
    /// Which pipeline to host
    pub kind: Option<PipelineKind>,
    /// Ollama host
    pub ollama_host: Option<String>,
    /// Ollama port
    pub ollama_port: Option<u16>,
    /// Generation model
    pub model: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Session limits
    pub session: SessionToml,
    /// Request limits
    pub request: RequestToml,
    /// Socket transport
    pub transport: TransportToml,
    /// Hosted pipeline
    pub pipeline: PipelineToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Pipeline a relay hosts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Ollama-backed generation
    #[default]
    Ollama,
    /// Built-in scripted demo
    Demo,
}

impl std::str::FromStr for PipelineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "demo" => Ok(Self::Demo),
            other => Err(ConfigError::ValidationError(format!(
                "unknown pipeline kind '{other}' (expected 'ollama' or 'demo')"
            ))),
        }
    }
}

/// Centralized configuration for a relay
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Session ceiling
    pub session_timeout: Duration,
    /// Maximum sessions streaming at once
    pub max_concurrent_sessions: usize,
    /// Pipeline channel capacity
    pub channel_capacity: usize,
    /// Inbound request limits
    pub limits: RequestLimits,
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Hosted pipeline
    pub pipeline: PipelineKind,
    /// Ollama host
    pub ollama_host: String,
    /// Ollama port
    pub ollama_port: u16,
    /// Generation model
    pub model: String,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_concurrent_sessions: 16,
            channel_capacity: 1,
            limits: RequestLimits::default(),
            socket_path: default_socket_path(),
            max_frame_size: MAX_FRAME_SIZE,
            pipeline: PipelineKind::default(),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            ollama_port: DEFAULT_OLLAMA_PORT,
            model: DEFAULT_MODEL.to_string(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Highest-priority layer that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Settings for a [`StreamManager`](crate::manager::StreamManager)
    #[must_use]
    pub fn manager_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            session_timeout: self.session_timeout,
            max_concurrent_sessions: self.max_concurrent_sessions,
            limits: self.limits.clone(),
        }
    }

    /// Reject values no relay can run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &str| -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(format!("{name} must be greater than zero")))
        };

        if self.session_timeout.is_zero() {
            return zero("session timeout");
        }
        if self.session_timeout > MAX_SESSION_TIMEOUT {
            return Err(ConfigError::ValidationError(format!(
                "session timeout must be at most {}s",
                MAX_SESSION_TIMEOUT.as_secs()
            )));
        }
        if self.max_concurrent_sessions == 0 {
            return zero("max_concurrent_sessions");
        }
        if self.channel_capacity == 0 {
            return zero("channel_capacity");
        }
        if self.limits.max_content_length == 0 {
            return zero("max_content_length");
        }
        if self.limits.max_session_id_length == 0 {
            return zero("max_session_id_length");
        }
        if self.max_frame_size == 0 {
            return zero("max_frame_size");
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Get the default socket path
///
/// `$XDG_RUNTIME_DIR/relay/relay.sock`, falling back to the temp directory.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("relay")
        .join("relay.sock")
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    apply_env_config(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(secs) = toml.session.timeout_secs {
        config.session_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = toml.session.max_concurrent_sessions {
        config.max_concurrent_sessions = max;
    }
    if let Some(capacity) = toml.session.channel_capacity {
        config.channel_capacity = capacity;
    }

    if let Some(length) = toml.request.max_content_length {
        config.limits.max_content_length = length;
    }
    if let Some(length) = toml.request.max_session_id_length {
        config.limits.max_session_id_length = length;
    }

    if let Some(ref path) = toml.transport.socket_path {
        config.socket_path = PathBuf::from(path);
    }
    if let Some(size) = toml.transport.max_frame_size {
        config.max_frame_size = size;
    }

    if let Some(kind) = toml.pipeline.kind {
        config.pipeline = kind;
    }
    if let Some(ref host) = toml.pipeline.ollama_host {
        config.ollama_host.clone_from(host);
    }
    if let Some(port) = toml.pipeline.ollama_port {
        config.ollama_port = port;
    }
    if let Some(ref model) = toml.pipeline.model {
        config.model.clone_from(model);
    }
}

/// Parse a numeric environment value, naming the variable on failure
fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{key}='{value}' is not a valid number"))
    })
}

fn apply_env_config(
    config: &mut RelayConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let mut touched = false;

    if let Some(v) = env("RELAY_SESSION_TIMEOUT_SECS") {
        config.session_timeout = Duration::from_secs(parse_env("RELAY_SESSION_TIMEOUT_SECS", &v)?);
        touched = true;
    }
    if let Some(v) = env("RELAY_MAX_SESSIONS") {
        config.max_concurrent_sessions = parse_env("RELAY_MAX_SESSIONS", &v)?;
        touched = true;
    }
    if let Some(v) = env("RELAY_MAX_CONTENT_LENGTH") {
        config.limits.max_content_length = parse_env("RELAY_MAX_CONTENT_LENGTH", &v)?;
        touched = true;
    }
    if let Some(v) = env("RELAY_SOCKET") {
        config.socket_path = PathBuf::from(v);
        touched = true;
    }
    if let Some(v) = env("RELAY_PIPELINE") {
        config.pipeline = v.parse()?;
        touched = true;
    }
    if let Some(v) = env("OLLAMA_HOST") {
        config.ollama_host = v;
        touched = true;
    }
    if let Some(v) = env("OLLAMA_PORT") {
        config.ollama_port = parse_env("OLLAMA_PORT", &v)?;
        touched = true;
    }
    if let Some(v) = env("RELAY_MODEL") {
        config.model = v;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Session timeout override (seconds)
    pub timeout_secs: Option<u64>,
    /// Max concurrent sessions override
    pub max_sessions: Option<usize>,
    /// Pipeline override
    pub pipeline: Option<PipelineKind>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set session timeout override
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set max concurrent sessions override
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Set pipeline override
    #[must_use]
    pub fn with_pipeline(mut self, kind: PipelineKind) -> Self {
        self.pipeline = Some(kind);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.socket_path.is_none()
            && self.timeout_secs.is_none()
            && self.max_sessions.is_none()
            && self.pipeline.is_none()
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the overridden configuration fails validation.
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if let Some(ref path) = self.socket_path {
            config.socket_path.clone_from(path);
        }
        if let Some(secs) = self.timeout_secs {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_sessions {
            config.max_concurrent_sessions = max;
        }
        if let Some(kind) = self.pipeline {
            config.pipeline = kind;
        }
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        config.validate()
    }
}
