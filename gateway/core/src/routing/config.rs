//! Backend Configuration
//!
//! Per-model backend settings. Each entry of the `[models]` table names a
//! backend `kind` plus the fields that kind needs.

use serde::{Deserialize, Serialize};

use crate::conversation::DEFAULT_CONTEXT_CHARS;
use crate::inference::{DEFAULT_INPUT_FORMAT, DEFAULT_RESPONSE_FORMAT};

/// Default system prompt for pooled backends
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant";

/// Default number of pooled inference connections per model
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Default timeout for proxied requests, in seconds
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 120;

/// Default timeout for opening a pooled inference connection, in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Backend Configuration
// ============================================================================

/// Configuration for one model's backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Fixed canned reply, no I/O
    #[serde(alias = "llama.cpp")]
    Echo,
    /// Remote OpenAI-compatible endpoint
    #[serde(alias = "openai_proxy")]
    Proxy(ProxyConfig),
    /// Pooled connections to an inference service
    #[serde(alias = "tcp_client")]
    Pooled(PooledConfig),
}

impl BackendConfig {
    /// Short name of the backend kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Proxy(_) => "proxy",
            Self::Pooled(_) => "pooled",
        }
    }

    /// Check kind-specific fields
    pub fn validate(&self, model_id: &str) -> Result<(), String> {
        match self {
            Self::Echo => Ok(()),
            Self::Proxy(proxy) => proxy.validate(model_id),
            Self::Pooled(pooled) => pooled.validate(model_id),
        }
    }
}

/// Remote OpenAI-compatible endpoint settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Base URL up to and including the API version (e.g. `https://api.openai.com/v1`)
    pub base_url: String,

    /// API key given inline
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model name sent upstream (defaults to the requested model)
    #[serde(default)]
    pub model: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

fn default_proxy_timeout() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

impl ProxyConfig {
    /// Create a proxy config for `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_key_env: None,
            model: None,
            timeout_secs: DEFAULT_PROXY_TIMEOUT_SECS,
        }
    }

    /// Resolve the API key: inline value first, then the named env var
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }

    fn validate(&self, model_id: &str) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err(format!("model '{model_id}': proxy base_url is empty"));
        }
        if self.timeout_secs == 0 {
            return Err(format!("model '{model_id}': proxy timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Pooled inference-service settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PooledConfig {
    /// Inference service host
    pub host: String,

    /// Inference service port
    pub port: u16,

    /// Model loaded on the service at setup
    pub model_name: String,

    /// System prompt used when the request has none
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Maximum simultaneous connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Character budget for non-system history
    #[serde(default = "default_context_chars")]
    pub max_context_chars: usize,

    /// Output format requested at setup
    #[serde(default = "default_response_format")]
    pub response_format: String,

    /// Input format declared at setup
    #[serde(default = "default_input_format")]
    pub input_format: String,

    /// Timeout for opening a connection, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_context_chars() -> usize {
    DEFAULT_CONTEXT_CHARS
}

fn default_response_format() -> String {
    DEFAULT_RESPONSE_FORMAT.to_string()
}

fn default_input_format() -> String {
    DEFAULT_INPUT_FORMAT.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl PooledConfig {
    /// Create a pooled config with defaults for everything but the target
    pub fn new(host: impl Into<String>, port: u16, model_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            model_name: model_name.into(),
            system_prompt: default_system_prompt(),
            pool_size: DEFAULT_POOL_SIZE,
            max_context_chars: DEFAULT_CONTEXT_CHARS,
            response_format: default_response_format(),
            input_format: default_input_format(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Set pool capacity
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set history budget
    #[must_use]
    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }

    /// Set the fallback system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn validate(&self, model_id: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("model '{model_id}': pooled host is empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(format!("model '{model_id}': pooled model_name is empty"));
        }
        if self.pool_size == 0 {
            return Err(format!("model '{model_id}': pool_size must be > 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(format!("model '{model_id}': connect_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_defaults_from_toml() {
        let config: BackendConfig = toml::from_str(
            r#"
            kind = "pooled"
            host = "10.0.0.2"
            port = 10001
            model_name = "qwen"
            "#,
        )
        .unwrap();

        match config {
            BackendConfig::Pooled(p) => {
                assert_eq!(p.pool_size, 2);
                assert_eq!(p.max_context_chars, 500);
                assert_eq!(p.system_prompt, "You are a helpful assistant");
                assert_eq!(p.response_format, "llm.utf-8.stream");
                assert_eq!(p.input_format, "llm.utf-8");
                assert_eq!(p.connect_timeout_secs, 10);
            }
            other => panic!("Expected pooled config, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_kind_aliases() {
        let config: BackendConfig = toml::from_str(
            r#"
            kind = "openai_proxy"
            base_url = "http://localhost:9000/v1"
            "#,
        )
        .unwrap();
        assert_eq!(config.kind(), "proxy");

        let config: BackendConfig = toml::from_str(r#"kind = "echo""#).unwrap();
        assert_eq!(config, BackendConfig::Echo);

        let config: BackendConfig = toml::from_str(r#"kind = "llama.cpp""#).unwrap();
        assert_eq!(config, BackendConfig::Echo);

        let config: BackendConfig = toml::from_str(
            r#"
            kind = "tcp_client"
            host = "127.0.0.1"
            port = 10001
            model_name = "qwen"
            "#,
        )
        .unwrap();
        assert_eq!(config.kind(), "pooled");
    }

    #[test]
    fn test_validation() {
        assert!(BackendConfig::Pooled(PooledConfig::new("h", 1, "m").with_pool_size(0))
            .validate("x")
            .is_err());
        assert!(BackendConfig::Pooled(PooledConfig::new("", 1, "m"))
            .validate("x")
            .is_err());
        let mut no_timeout = PooledConfig::new("h", 1, "m");
        no_timeout.connect_timeout_secs = 0;
        assert!(BackendConfig::Pooled(no_timeout).validate("x").is_err());
        assert!(BackendConfig::Proxy(ProxyConfig::new(" "))
            .validate("x")
            .is_err());
        assert!(BackendConfig::Proxy(ProxyConfig::new("http://a/v1"))
            .validate("x")
            .is_ok());
    }

    #[test]
    fn test_inline_api_key_wins() {
        let mut config = ProxyConfig::new("http://a/v1");
        config.api_key = Some("inline".to_string());
        config.api_key_env = Some("GATEWAY_TEST_UNSET_KEY_VAR".to_string());
        assert_eq!(config.resolve_api_key().as_deref(), Some("inline"));

        config.api_key = None;
        assert_eq!(config.resolve_api_key(), None);
    }
}
