//! HTTP Server Implementation
//!
//! This module provides the OpenAI-compatible HTTP surface of the gateway:
//! - Routes `/v1/chat/completions` and `/v1/completions` through the dispatcher
//! - Renders canonical results as JSON or SSE
//! - Enforces bearer-token auth on `/v1/*` when an API key is configured
//! - Maps backend failures to HTTP status codes
//!
//! ```text
//!          Client
//!            │  POST /v1/chat/completions
//!            v
//!     require_api_key ──401──> Client
//!            │
//!            v
//!       chat_completions ──> Dispatcher ──> Backend
//!            │                                 │
//!            └──── JSON body / SSE frames <────┘
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{future, stream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use gateway_core::{
    BackendError, BackendErrorKind, ChunkStream, Dispatcher, GenerationRequest, GenerationResult,
    LlmBackend,
};

use crate::wire::{self, ChatCompletionRequest, CompletionRequest, ResponseMeta, DONE_FRAME};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    api_key: Option<Arc<str>>,
}

impl AppState {
    /// Create state. `api_key` of `None` disables auth.
    pub fn new(dispatcher: Dispatcher, api_key: Option<String>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            api_key: api_key.map(Arc::from),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(v1)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gateway shut down");
    Ok(())
}

// =============================================================================
// Errors
// =============================================================================

/// Error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            kind: "invalid_request",
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            kind: "internal_error",
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        let status = match err.kind {
            BackendErrorKind::NotFound => StatusCode::BAD_REQUEST,
            BackendErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            BackendErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            BackendErrorKind::Inference => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.message,
            kind: err.kind.as_str(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({"error": {"message": self.message, "type": self.kind}}));
        let mut response = (self.status, body).into_response();

        // Exhaustion clears as soon as any in-flight request finishes
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Rejected request body");
        ApiError::bad_request(format!("Invalid request body: {e}"))
    })
}

// =============================================================================
// Middleware
// =============================================================================

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected unauthenticated request");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid authentication credentials"})),
        )
            .into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(wire::model_list(&state.dispatcher.models()))
}

/// Resolve and run a request
async fn generate(
    state: &AppState,
    request: GenerationRequest,
) -> Result<GenerationResult, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    let backend = state
        .dispatcher
        .resolve(&request.model)
        .map_err(|e| ApiError::from(BackendError::from(e)))?;

    info!(
        model = %request.model,
        backend = backend.name(),
        stream = request.stream,
        messages = request.messages.len(),
        "Processing generation request"
    );

    backend.generate(request).await.map_err(|e| {
        error!(error = %e, "Generation failed");
        ApiError::from(e)
    })
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: ChatCompletionRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    let meta = ResponseMeta::new("chatcmpl", parsed.model.clone());

    match generate(&state, parsed.into()).await {
        Ok(GenerationResult::Completion(unit)) => {
            Json(wire::chat_completion(&meta, &unit)).into_response()
        }
        Ok(GenerationResult::Upstream(body)) => Json(body).into_response(),
        Ok(GenerationResult::Stream(chunks)) => {
            sse_response(sse_frames(chunks, move |chunk| wire::chat_chunk(&meta, chunk)))
        }
        Err(e) => e.into_response(),
    }
}

async fn completions(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: CompletionRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    let meta = ResponseMeta::new("cmpl", parsed.model.clone());

    match generate(&state, parsed.into()).await {
        Ok(GenerationResult::Completion(unit)) => {
            Json(wire::text_completion(&meta, &unit)).into_response()
        }
        Ok(GenerationResult::Upstream(body)) => {
            Json(wire::text_completion_from_upstream(&meta, &body)).into_response()
        }
        Ok(GenerationResult::Stream(chunks)) => {
            sse_response(sse_frames(chunks, move |chunk| wire::text_chunk(&meta, chunk)))
        }
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// SSE
// =============================================================================

/// Render chunks as SSE frames, ending with `[DONE]`.
///
/// A trailing stream error has already been reported in-band, so it is only
/// logged here.
fn sse_frames<F>(
    chunks: ChunkStream,
    render: F,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static
where
    F: Fn(gateway_core::StreamChunk) -> serde_json::Value + Send + 'static,
{
    chunks
        .filter_map(move |item| {
            let frame = match item {
                Ok(chunk) => Some(Ok(wire::sse_frame(&render(chunk)))),
                Err(e) => {
                    error!(kind = %e.kind, error = %e.message, "Stream ended with error");
                    None
                }
            };
            future::ready(frame)
        })
        .chain(stream::once(future::ready(Ok(DONE_FRAME.to_string()))))
}

fn sse_response(frames: impl Stream<Item = Result<String, Infallible>> + Send + 'static) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| ApiError::internal("failed to build stream response").into_response())
}
