//! Gateway Core - Model Routing and Stream Adaptation
//!
//! This crate holds everything the gateway does between an OpenAI-style
//! request arriving and chunks leaving, independent of the HTTP layer that
//! serves it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        HTTP Surface (daemon)                      │
//! │        /v1/chat/completions   /v1/completions   /v1/models        │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ GenerationRequest
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          GATEWAY CORE                             │
//! │                    ┌──────────┴──────────┐                        │
//! │                    │     Dispatcher      │                        │
//! │                    └──────────┬──────────┘                        │
//! │          ┌────────────────────┼─────────────────────┐             │
//! │   ┌──────┴─────┐       ┌──────┴──────┐      ┌───────┴────────┐    │
//! │   │    Echo    │       │    Proxy    │      │     Pooled     │    │
//! │   └────────────┘       │  (reqwest)  │      │ Truncator      │    │
//! │                        └─────────────┘      │ ConnectionPool │    │
//! │                                             │ Chunk Adapter  │    │
//! │                                             └───────┬────────┘    │
//! └─────────────────────────────────────────────────────┼────────────┘
//!                                                       │ TCP
//!                                              Inference service
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: model id to backend table, built once from config
//! - [`Backend`]: closed set of backend kinds implementing [`LlmBackend`]
//! - [`GenerationResult`]: completion, pass-through body, or chunk stream
//! - [`ConnectionPool`]: bounded LIFO pool with RAII leases
//! - [`BlockingTokenStream`]: async view over a blocking token iterator
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{load_config_from_path, Dispatcher, GenerationRequest, LlmBackend, Message};
//!
//! let config = load_config_from_path(None)?;
//! let dispatcher = Dispatcher::from_config(&config)?;
//!
//! let backend = dispatcher.resolve("echo-test")?;
//! let request = GenerationRequest::new("echo-test", vec![Message::user("Hello")]);
//! let result = backend.generate(request).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: backend trait, result types and the three backends
//! - [`config`]: TOML configuration loading
//! - [`conversation`]: history truncation and query flattening
//! - [`inference`]: blocking inference-service client contract
//! - [`messages`]: chat message types
//! - [`routing`]: dispatcher, per-model config and connection pool
//! - [`streaming`]: blocking-to-async chunk adapter

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod inference;
pub mod messages;
pub mod routing;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    Backend, BackendError, BackendErrorKind, ChunkStream, ChunkUnit, CompletionUnit,
    FinishReason, GenerationRequest, GenerationResult, LlmBackend, StreamChunk,
};
pub use messages::{Message, MessageRole};

// Routing exports
pub use routing::{
    BackendConfig, ConnectionPool, DispatchError, Dispatcher, ModelEntry, PoolError, PoolStats,
};

// Streaming exports
pub use streaming::{AdapterEvent, BlockingTokenStream};

// Config exports
pub use config::{
    default_config_path, load_config_from_path, ConfigError, ConfigSource, GatewayConfig,
    ServerSettings,
};
