//! Inference Service Client Contract
//!
//! The pooled backend talks to an external inference service through a
//! blocking client with a three-step contract: `setup` once per connection,
//! `inference_stream` per query (returning a blocking iterator of text
//! fragments), and teardown when the client is dropped.
//!
//! Every method here may block on network I/O. Callers on the async runtime
//! must run them through `tokio::task::spawn_blocking`.
//!
//! [`StackFlowClient`] is the concrete client for services speaking
//! newline-delimited JSON over TCP.

mod stackflow;

use thiserror::Error;

pub use stackflow::StackFlowClient;

/// Default response format requested at setup
pub const DEFAULT_RESPONSE_FORMAT: &str = "llm.utf-8.stream";

/// Default input format declared at setup
pub const DEFAULT_INPUT_FORMAT: &str = "llm.utf-8";

/// Errors raised by an inference client
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The service sent something we could not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service reported an error
    #[error("Inference service error {code}: {message}")]
    Remote {
        /// Service error code
        code: i64,
        /// Service error message
        message: String,
    },

    /// `inference_stream` called before a successful `setup`
    #[error("Client is not set up")]
    NotSetUp,
}

/// Options sent with the one-time setup call
#[derive(Clone, Debug, PartialEq)]
pub struct SetupOptions {
    /// Model to load on the service
    pub model: String,
    /// Output encoding requested from the service
    pub response_format: String,
    /// Input encoding declared to the service
    pub input_format: String,
    /// Echo-suppression / output-enable flag passed through to the service
    pub echo_suppressed: bool,
    /// Maximum output length
    pub max_output_len: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// System prompt
    pub system_prompt: String,
}

/// Blocking iterator of generated text fragments
pub type TokenIter = Box<dyn Iterator<Item = Result<String, InferenceError>> + Send>;

/// A blocking client for an external inference session
pub trait InferenceClient: Send + 'static {
    /// Configure the session. Called once per connection.
    fn setup(&mut self, options: &SetupOptions) -> Result<(), InferenceError>;

    /// Submit `query` and return the fragments of the answer.
    ///
    /// The returned iterator owns everything it needs, so it can be moved to
    /// another thread independently of `self`.
    fn inference_stream(&mut self, query: &str) -> Result<TokenIter, InferenceError>;
}

/// Creates fresh, not-yet-set-up clients for the connection pool.
///
/// Creation must be cheap and must not perform I/O; connecting happens in
/// [`InferenceClient::setup`].
pub trait ClientFactory<C>: Send + Sync {
    /// Build a new client
    fn create(&self) -> C;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn() -> C + Send + Sync,
{
    fn create(&self) -> C {
        self()
    }
}

impl InferenceClient for Box<dyn InferenceClient> {
    fn setup(&mut self, options: &SetupOptions) -> Result<(), InferenceError> {
        (**self).setup(options)
    }

    fn inference_stream(&mut self, query: &str) -> Result<TokenIter, InferenceError> {
        (**self).inference_stream(query)
    }
}
