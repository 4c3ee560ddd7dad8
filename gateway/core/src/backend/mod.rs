//! LLM Backend Integration
//!
//! This module provides access to the gateway's model sources through a
//! common trait interface.
//!
//! # Available Backends
//!
//! - **Echo**: canned reply, no I/O
//! - **Proxy**: remote OpenAI-compatible endpoint
//! - **Pooled**: external inference service behind a connection pool
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{Backend, GenerationRequest, LlmBackend};
//!
//! let backend = Backend::from_config(&BackendConfig::Echo)?;
//! let request = GenerationRequest::new("echo-test", messages);
//! let result = backend.generate(request).await?;
//! ```

mod echo;
mod pooled;
mod proxy;
mod traits;

use async_trait::async_trait;

pub use echo::{EchoBackend, ECHO_FRAGMENTS};
pub use pooled::{PooledBackend, PooledClient};
pub use proxy::ProxyBackend;
pub use traits::{
    BackendError, BackendErrorKind, ChunkStream, ChunkUnit, CompletionUnit, FinishReason,
    GenerationRequest, GenerationResult, LlmBackend, StreamChunk, DEFAULT_MAX_OUTPUT_TOKENS,
    DEFAULT_TEMPERATURE,
};

use crate::routing::config::BackendConfig;

/// One configured backend.
///
/// The set of kinds is closed, so dispatch is a plain `match`.
#[derive(Debug)]
pub enum Backend {
    /// Canned reply
    Echo(EchoBackend),
    /// Remote relay
    Proxy(ProxyBackend),
    /// Pooled inference sessions
    Pooled(PooledBackend),
}

impl Backend {
    /// Build the backend described by `config`
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(match config {
            BackendConfig::Echo => Self::Echo(EchoBackend::new()),
            BackendConfig::Proxy(proxy) => Self::Proxy(ProxyBackend::from_config(proxy)?),
            BackendConfig::Pooled(pooled) => Self::Pooled(PooledBackend::from_config(pooled)),
        })
    }
}

#[async_trait]
impl LlmBackend for Backend {
    fn name(&self) -> &str {
        match self {
            Self::Echo(b) => b.name(),
            Self::Proxy(b) => b.name(),
            Self::Pooled(b) => b.name(),
        }
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        match self {
            Self::Echo(b) => b.generate(request).await,
            Self::Proxy(b) => b.generate(request).await,
            Self::Pooled(b) => b.generate(request).await,
        }
    }
}
