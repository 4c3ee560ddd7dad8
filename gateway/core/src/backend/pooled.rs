//! Pooled inference backend
//!
//! Serves a model from an external inference service through a bounded pool
//! of stateful connections. Each request:
//!
//! 1. trims the history to the character budget,
//! 2. flattens it into a single query string,
//! 3. leases a connection (failing fast when the pool is full),
//! 4. runs the one-time session setup if the connection is fresh,
//! 5. streams the answer through [`BlockingTokenStream`].
//!
//! The lease travels with the token iterator, so the connection goes back
//! to the pool when the answer ends, fails, or the caller stops listening.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tracing::{debug, error, info};

use super::traits::{
    BackendError, ChunkStream, ChunkUnit, CompletionUnit, FinishReason, GenerationRequest,
    GenerationResult, LlmBackend, StreamChunk,
};
use crate::conversation::{build_query, first_system_prompt, truncate_history};
use crate::inference::{
    ClientFactory, InferenceClient, InferenceError, SetupOptions, StackFlowClient, TokenIter,
};
use crate::routing::config::PooledConfig;
use crate::routing::connection_pool::{ConnectionPool, Lease, PoolStats};
use crate::streaming::{AdapterEvent, BlockingTokenStream};

/// Client type held by the pool
pub type PooledClient = Box<dyn InferenceClient>;

/// Token iterator that keeps its connection leased until dropped
struct LeasedTokens {
    tokens: TokenIter,
    _lease: Lease<PooledClient>,
}

impl Iterator for LeasedTokens {
    type Item = Result<String, InferenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.tokens.next()
    }
}

/// Backend backed by a pool of inference-service connections
#[derive(Debug)]
pub struct PooledBackend {
    config: PooledConfig,
    pool: ConnectionPool<PooledClient>,
}

impl PooledBackend {
    /// Build a backend whose connections are [`StackFlowClient`]s
    #[must_use]
    pub fn from_config(config: &PooledConfig) -> Self {
        let host = config.host.clone();
        let port = config.port;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        Self::with_factory(config, move || -> PooledClient {
            Box::new(StackFlowClient::new(host.clone(), port).with_connect_timeout(connect_timeout))
        })
    }

    /// Build a backend with a custom client factory
    pub fn with_factory(
        config: &PooledConfig,
        factory: impl ClientFactory<PooledClient> + 'static,
    ) -> Self {
        let pool = ConnectionPool::new(
            format!("{}:{}", config.host, config.port),
            config.pool_size,
            factory,
        );
        Self {
            config: config.clone(),
            pool,
        }
    }

    /// Pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn setup_options(&self, request: &GenerationRequest) -> SetupOptions {
        let system_prompt = first_system_prompt(&request.messages)
            .unwrap_or(&self.config.system_prompt)
            .to_string();
        SetupOptions {
            model: self.config.model_name.clone(),
            response_format: self.config.response_format.clone(),
            input_format: self.config.input_format.clone(),
            echo_suppressed: true,
            max_output_len: request.max_output_tokens,
            temperature: request.temperature,
            system_prompt,
        }
    }

    /// Lease a connection, set it up if needed and start the query
    async fn start(&self, request: &GenerationRequest) -> Result<LeasedTokens, BackendError> {
        let history = truncate_history(&request.messages, self.config.max_context_chars);
        let query = build_query(&history);
        let options = self.setup_options(request);

        let mut lease = self
            .pool
            .acquire()
            .map_err(|e| BackendError::pool_exhausted(e.to_string()))?;
        let connection_id = lease.id();
        debug!(
            model = %request.model,
            connection_id = %connection_id,
            kept_messages = history.len(),
            "Leased inference connection"
        );

        let started = tokio::task::spawn_blocking(move || -> Result<LeasedTokens, InferenceError> {
            let connection = lease.connection_mut();
            if !connection.is_initialized() {
                debug!(connection_id = %connection_id, model = %options.model, "Setting up inference session");
                connection.client_mut().setup(&options)?;
                connection.mark_initialized();
            }
            let tokens = connection.client_mut().inference_stream(&query)?;
            Ok(LeasedTokens {
                tokens,
                _lease: lease,
            })
        })
        .await
        .map_err(|e| BackendError::inference(format!("inference worker failed: {e}")))?;

        started.map_err(|e| {
            error!(connection_id = %connection_id, error = %e, "Failed to start inference");
            BackendError::inference(e.to_string())
        })
    }
}

/// Where a pooled chunk stream is in its sequence
enum Phase {
    Streaming {
        adapter: BlockingTokenStream<LeasedTokens>,
        first: bool,
    },
    Failed(BackendError),
    Reraise(BackendError),
    Done,
}

fn chunk_stream(adapter: BlockingTokenStream<LeasedTokens>) -> ChunkStream {
    let start = Phase::Streaming {
        adapter,
        first: true,
    };

    Box::pin(stream::unfold(start, |phase| async move {
        match phase {
            Phase::Streaming { mut adapter, first } => match adapter.next().await {
                Some(AdapterEvent::Token(token)) => Some((
                    Ok(StreamChunk::Delta(ChunkUnit::delta(token, first))),
                    Phase::Streaming {
                        adapter,
                        first: false,
                    },
                )),
                Some(AdapterEvent::Failed(e)) => {
                    error!(error = %e, "Inference stream failed");
                    let err = BackendError::inference(e.to_string());
                    Some((
                        Ok(StreamChunk::Error {
                            message: err.message.clone(),
                        }),
                        Phase::Failed(err),
                    ))
                }
                None => Some((
                    Ok(StreamChunk::Delta(ChunkUnit::terminal(FinishReason::Stop))),
                    Phase::Done,
                )),
            },
            Phase::Failed(err) => Some((
                Ok(StreamChunk::Delta(ChunkUnit::terminal(FinishReason::Stop))),
                Phase::Reraise(err),
            )),
            Phase::Reraise(err) => Some((Err(err), Phase::Done)),
            Phase::Done => None,
        }
    }))
}

#[async_trait]
impl LlmBackend for PooledBackend {
    fn name(&self) -> &str {
        "pooled"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        info!(model = %request.model, stream = request.stream, "Pooled generation");

        let tokens = self.start(&request).await?;
        let mut adapter = BlockingTokenStream::new(tokens);

        if request.stream {
            return Ok(GenerationResult::Stream(chunk_stream(adapter)));
        }

        let mut content = String::new();
        while let Some(event) = adapter.next().await {
            match event {
                AdapterEvent::Token(token) => content.push_str(&token),
                AdapterEvent::Failed(e) => {
                    error!(error = %e, "Inference failed");
                    return Err(BackendError::inference(e.to_string()));
                }
            }
        }
        Ok(GenerationResult::Completion(CompletionUnit::assistant(
            content,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::traits::BackendErrorKind;
    use crate::messages::{Message, MessageRole};

    #[derive(Clone, Debug)]
    enum Step {
        Token(&'static str),
        Fail(&'static str),
    }

    /// Records what the backend asked of its clients
    #[derive(Clone, Default)]
    struct Recorder {
        setups: Arc<Mutex<Vec<SetupOptions>>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    struct ScriptedClient {
        recorder: Recorder,
        script: Vec<Step>,
        fail_setup: bool,
    }

    impl InferenceClient for ScriptedClient {
        fn setup(&mut self, options: &SetupOptions) -> Result<(), InferenceError> {
            self.recorder.setups.lock().push(options.clone());
            if self.fail_setup {
                return Err(InferenceError::Protocol("setup rejected".to_string()));
            }
            Ok(())
        }

        fn inference_stream(&mut self, query: &str) -> Result<TokenIter, InferenceError> {
            self.recorder.queries.lock().push(query.to_string());
            let items: Vec<Result<String, InferenceError>> = self
                .script
                .iter()
                .map(|step| match step {
                    Step::Token(t) => Ok((*t).to_string()),
                    Step::Fail(m) => Err(InferenceError::Protocol((*m).to_string())),
                })
                .collect();
            Ok(Box::new(items.into_iter()))
        }
    }

    fn backend(pool_size: usize, script: Vec<Step>, fail_setup: bool) -> (PooledBackend, Recorder) {
        let recorder = Recorder::default();
        let config = PooledConfig::new("127.0.0.1", 10001, "qwen-test").with_pool_size(pool_size);
        let factory_recorder = recorder.clone();
        let backend = PooledBackend::with_factory(&config, move || -> PooledClient {
            Box::new(ScriptedClient {
                recorder: factory_recorder.clone(),
                script: script.clone(),
                fail_setup,
            })
        });
        (backend, recorder)
    }

    fn request(stream: bool) -> GenerationRequest {
        GenerationRequest::new("qwen-local", vec![Message::user("Hi")]).with_stream(stream)
    }

    async fn collect(result: GenerationResult) -> Vec<Result<StreamChunk, BackendError>> {
        match result {
            GenerationResult::Stream(stream) => stream.collect().await,
            other => panic!("Expected stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_success() {
        let (backend, _) = backend(2, vec![Step::Token("Hel"), Step::Token("lo")], false);

        let items = collect(backend.generate(request(true)).await.unwrap()).await;

        assert_eq!(
            items,
            vec![
                Ok(StreamChunk::Delta(ChunkUnit::delta("Hel", true))),
                Ok(StreamChunk::Delta(ChunkUnit::delta("lo", false))),
                Ok(StreamChunk::Delta(ChunkUnit::terminal(FinishReason::Stop))),
            ]
        );
        let stats = backend.pool_stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.checked_out, 0);
    }

    #[tokio::test]
    async fn test_non_streaming_concatenates_deltas() {
        let script = vec![Step::Token("Hel"), Step::Token("lo"), Step::Token("!")];
        let (backend, _) = backend(1, script, false);

        let result = backend.generate(request(false)).await.unwrap();
        let GenerationResult::Completion(unit) = result else {
            panic!("Expected completion");
        };
        assert_eq!(unit.content, "Hello!");
        assert_eq!(unit.role, MessageRole::Assistant);
        assert_eq!(unit.finish_reason, FinishReason::Stop);

        let streamed: String = collect(backend.generate(request(true)).await.unwrap())
            .await
            .into_iter()
            .filter_map(|item| match item {
                Ok(StreamChunk::Delta(chunk)) => Some(chunk.delta_content),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, unit.content);
    }

    #[tokio::test]
    async fn test_mid_stream_error() {
        let (backend, _) = backend(2, vec![Step::Token("a"), Step::Fail("socket closed")], false);

        let items = collect(backend.generate(request(true)).await.unwrap()).await;

        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Ok(StreamChunk::Delta(ChunkUnit::delta("a", true))));
        assert!(matches!(&items[1], Ok(StreamChunk::Error { message }) if message.contains("socket closed")));
        assert_eq!(
            items[2],
            Ok(StreamChunk::Delta(ChunkUnit::terminal(FinishReason::Stop)))
        );
        assert!(matches!(&items[3], Err(e) if e.kind == BackendErrorKind::Inference));

        let stats = backend.pool_stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.checked_out, 0);
    }

    #[tokio::test]
    async fn test_non_streaming_error() {
        let (backend, _) = backend(1, vec![Step::Fail("boom")], false);

        let err = backend.generate(request(false)).await.unwrap_err();

        assert_eq!(err.kind, BackendErrorKind::Inference);
        assert_eq!(backend.pool_stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_fast() {
        let (backend, recorder) = backend(1, vec![Step::Token("x")], false);

        let held = backend.generate(request(true)).await.unwrap();
        assert_eq!(backend.pool_stats().checked_out, 1);

        let err = backend.generate(request(true)).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::PoolExhausted);
        assert_eq!(recorder.queries.lock().len(), 1);

        drop(held);
        assert_eq!(backend.pool_stats().checked_out, 0);
        assert!(backend.generate(request(false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_caller_drop_releases_connection() {
        let (backend, _) = backend(1, vec![Step::Token("a"), Step::Token("b")], false);

        let GenerationResult::Stream(mut stream) = backend.generate(request(true)).await.unwrap()
        else {
            panic!("Expected stream");
        };
        assert!(stream.next().await.is_some());
        drop(stream);

        let stats = backend.pool_stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_bounds_setup() {
        // non-routable address; the connect attempt hangs until the timeout
        let mut config = PooledConfig::new("10.255.255.1", 10001, "qwen-test");
        config.connect_timeout_secs = 1;
        let backend = PooledBackend::from_config(&config);

        let started = std::time::Instant::now();
        let err = backend.generate(request(false)).await.unwrap_err();

        assert_eq!(err.kind, BackendErrorKind::Inference);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(backend.pool_stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_setup_once_per_connection() {
        let (backend, recorder) = backend(2, vec![Step::Token("ok")], false);

        for _ in 0..3 {
            backend.generate(request(false)).await.unwrap();
        }

        assert_eq!(recorder.setups.lock().len(), 1);
        assert_eq!(recorder.queries.lock().len(), 3);
        assert_eq!(backend.pool_stats().connections_created, 1);
    }

    #[tokio::test]
    async fn test_failed_setup_is_retried_on_next_lease() {
        let (backend, recorder) = backend(1, vec![Step::Token("never")], true);

        let err = backend.generate(request(false)).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Inference);
        assert!(err.message.contains("setup rejected"));
        assert_eq!(backend.pool_stats().checked_out, 0);

        let _ = backend.generate(request(false)).await;
        assert_eq!(recorder.setups.lock().len(), 2);
        assert!(recorder.queries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_query_and_setup_options() {
        let (backend, recorder) = backend(1, vec![Step::Token("ok")], false);
        let request = GenerationRequest::new(
            "qwen-local",
            vec![
                Message::system("Be brief"),
                Message::user("Hi"),
                Message::assistant("Hello"),
                Message::user("Bye"),
            ],
        )
        .with_temperature(0.3)
        .with_max_output_tokens(256);

        backend.generate(request).await.unwrap();

        assert_eq!(recorder.queries.lock()[0], "user: Hi\nassistant: Hello\nuser: Bye");
        let setup = recorder.setups.lock()[0].clone();
        assert_eq!(setup.model, "qwen-test");
        assert_eq!(setup.system_prompt, "Be brief");
        assert_eq!(setup.max_output_len, 256);
        assert!(setup.echo_suppressed);
        assert!((setup.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_default_system_prompt() {
        let (backend, recorder) = backend(1, vec![Step::Token("ok")], false);

        backend.generate(request(false)).await.unwrap();

        assert_eq!(
            recorder.setups.lock()[0].system_prompt,
            "You are a helpful assistant"
        );
    }
}
