//! TOML Configuration File Support
//!
//! The gateway reads one TOML file at startup, by default
//! `$XDG_CONFIG_HOME/model-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`GATEWAY_BIND`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//! api_key_env = "API_KEY"
//!
//! [models.echo-test]
//! kind = "echo"
//!
//! [models.gpt-proxy]
//! kind = "proxy"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//! model = "gpt-4o-mini"
//!
//! [models.qwen-local]
//! kind = "pooled"
//! host = "192.168.20.24"
//! port = 10001
//! model_name = "qwen2.5-0.5B-prefill-20e"
//! pool_size = 2
//! max_context_chars = 500
//! ```
//!
//! The model table is read once; there is no reload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::BackendConfig;

/// Default listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Default env var holding the client API key
pub const DEFAULT_API_KEY_ENV: &str = "API_KEY";

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

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Loaded from a TOML file
    File,
    /// Built-in defaults
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address
    pub bind: String,

    /// Environment variable holding the bearer token clients must send.
    /// Auth is disabled when the variable is unset.
    pub api_key_env: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

impl ServerSettings {
    /// Read the client API key from the environment
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

/// The whole gateway configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Model identifier to backend configuration
    #[serde(default)]
    pub models: BTreeMap<String, BackendConfig>,

    /// Where this configuration came from
    #[serde(skip, default = "default_source")]
    pub source: ConfigSource,
}

fn default_source() -> ConfigSource {
    ConfigSource::File
}

impl Default for GatewayConfig {
    /// A single echo model, enough to exercise the API without any backend
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert("echo-test".to_string(), BackendConfig::Echo);
        Self {
            server: ServerSettings::default(),
            models,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::ValidationError(
                "no models configured".to_string(),
            ));
        }
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.bind is empty".to_string(),
            ));
        }
        for (model_id, backend) in &self.models {
            backend.validate(model_id).map_err(ConfigError::ValidationError)?;
        }
        Ok(())
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("GATEWAY_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }
    }
}

/// Default configuration path (`$XDG_CONFIG_HOME/model-gateway/gateway.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("model-gateway").join("gateway.toml"))
}

/// Load configuration from `path`, or the default path when `None`.
///
/// A missing file falls back to [`GatewayConfig::default`]; a file that
/// exists but cannot be read, parsed or validated is an error.
pub fn load_config_from_path(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let default_path = default_config_path();
    let path = path.or(default_path.as_deref());

    let mut config = match path {
        Some(config_path) if config_path.exists() => {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let config = GatewayConfig::from_toml_str(&content)?;
            tracing::info!(
                path = %config_path.display(),
                models = config.models.len(),
                "Loaded configuration from file"
            );
            config
        }
        Some(config_path) => {
            tracing::warn!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
            GatewayConfig::default()
        }
        None => GatewayConfig::default(),
    };

    config.apply_env();
    Ok(config)
}
