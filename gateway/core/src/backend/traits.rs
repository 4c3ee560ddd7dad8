//! LLM Backend Traits
//!
//! Trait and data definitions shared by every backend. This abstraction lets
//! the gateway serve echo stubs, remote proxies and pooled inference
//! sessions through one `generate` contract.
//!
//! # Design Philosophy
//!
//! A backend turns a [`GenerationRequest`] into a [`GenerationResult`]:
//! - a single [`CompletionUnit`] for non-streaming requests,
//! - a remote body passed through untouched (proxy only), or
//! - a lazy [`ChunkStream`] of canonical chunks.
//!
//! Rendering those into OpenAI JSON or SSE frames is the caller's job.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{Message, MessageRole};

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default maximum output tokens
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1000;

/// A generation request as seen by a backend
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// Model identifier used for routing
    pub model: String,
    /// Conversation, oldest first
    pub messages: Vec<Message>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_output_tokens: u32,
    /// Whether the caller wants a chunk stream
    pub stream: bool,
}

impl GenerationRequest {
    /// Create a request with default sampling settings
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            stream: false,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set max output tokens
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// Why generation stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Natural end of output
    Stop,
    /// Output hit the length limit
    Length,
}

impl FinishReason {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// A complete, non-streamed answer
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionUnit {
    /// Author role (always assistant for generated text)
    pub role: MessageRole,
    /// Full answer text
    pub content: String,
    /// Why generation stopped
    pub finish_reason: FinishReason,
}

impl CompletionUnit {
    /// Assistant answer that stopped normally
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            finish_reason: FinishReason::Stop,
        }
    }
}

/// One canonical piece of a streamed answer
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkUnit {
    /// Text added by this chunk
    pub delta_content: String,
    /// Whether this is the first chunk of the answer
    pub is_first: bool,
    /// Role marker, present on the first chunk
    pub role: Option<MessageRole>,
    /// Set on the chunk that ends the answer
    pub finish_reason: Option<FinishReason>,
}

impl ChunkUnit {
    /// A content chunk. The first one carries the assistant role.
    pub fn delta(content: impl Into<String>, is_first: bool) -> Self {
        Self {
            delta_content: content.into(),
            is_first,
            role: is_first.then_some(MessageRole::Assistant),
            finish_reason: None,
        }
    }

    /// The terminal chunk: empty delta plus a finish marker
    #[must_use]
    pub fn terminal(finish_reason: FinishReason) -> Self {
        Self {
            delta_content: String::new(),
            is_first: false,
            role: None,
            finish_reason: Some(finish_reason),
        }
    }

    /// Attach a finish marker to this chunk
    #[must_use]
    pub fn finishing(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = Some(finish_reason);
        self
    }
}

/// Item of a chunk stream
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    /// Canonical content or terminal chunk
    Delta(ChunkUnit),
    /// In-band error report; a terminal chunk follows
    Error {
        /// Human-readable failure description
        message: String,
    },
    /// Chunk from a remote OpenAI-compatible endpoint, unchanged
    Upstream(serde_json::Value),
}

/// Lazy, single-use stream of chunks.
///
/// A trailing `Err` item after the terminal chunk re-raises a failure that was
/// already reported in-band.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, BackendError>> + Send>>;

/// Output of [`LlmBackend::generate`]
pub enum GenerationResult {
    /// Complete answer
    Completion(CompletionUnit),
    /// Remote response body, unchanged
    Upstream(serde_json::Value),
    /// Streamed answer
    Stream(ChunkStream),
}

impl fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completion(unit) => f.debug_tuple("Completion").field(unit).finish(),
            Self::Upstream(body) => f.debug_tuple("Upstream").field(body).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Failure category of a backend call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    /// Unknown model
    NotFound,
    /// Pool capacity reached; the request was rejected without queuing
    PoolExhausted,
    /// Remote proxy endpoint failed
    Upstream,
    /// Pooled inference client failed during setup or streaming
    Inference,
}

impl BackendErrorKind {
    /// Stable snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PoolExhausted => "pool_exhausted",
            Self::Upstream => "upstream",
            Self::Inference => "inference",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed backend failure with a human-readable message
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// Failure category
    pub kind: BackendErrorKind,
    /// Description
    pub message: String,
}

impl BackendError {
    /// Create an error of `kind`
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Unknown model
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    /// Pool exhausted
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::PoolExhausted, message)
    }

    /// Upstream failure
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Upstream, message)
    }

    /// Inference failure
    pub fn inference(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Inference, message)
    }
}

/// LLM Backend trait
///
/// Implement this trait to add support for a new kind of model source.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name (e.g. "echo", "proxy")
    fn name(&self) -> &str;

    /// Fulfil a request.
    ///
    /// Never fails on a well-formed request for its own sake; every error
    /// comes from a downstream failure.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError>;
}
