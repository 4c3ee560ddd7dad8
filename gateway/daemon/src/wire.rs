//! OpenAI wire format
//!
//! Request bodies accepted by the HTTP surface and the JSON shapes rendered
//! from canonical backend results. Everything here is pure data mapping.

use serde::Deserialize;
use serde_json::{json, Value};

use gateway_core::backend::{DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE};
use gateway_core::{ChunkUnit, CompletionUnit, GenerationRequest, Message, ModelEntry, StreamChunk};

/// Final SSE frame of every stream
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_OUTPUT_TOKENS
}

// =============================================================================
// Requests
// =============================================================================

/// `POST /v1/chat/completions` body
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model id
    pub model: String,
    /// Conversation, oldest first
    pub messages: Vec<Message>,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stream the answer as SSE
    #[serde(default)]
    pub stream: bool,
}

impl From<ChatCompletionRequest> for GenerationRequest {
    fn from(req: ChatCompletionRequest) -> Self {
        GenerationRequest::new(req.model, req.messages)
            .with_temperature(req.temperature)
            .with_max_output_tokens(req.max_tokens)
            .with_stream(req.stream)
    }
}

/// `POST /v1/completions` body
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    /// Requested model id
    pub model: String,
    /// Prompt text, sent as a single user message
    pub prompt: String,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Stream the answer as SSE
    #[serde(default)]
    pub stream: bool,
}

impl From<CompletionRequest> for GenerationRequest {
    fn from(req: CompletionRequest) -> Self {
        GenerationRequest::new(req.model, vec![Message::user(req.prompt)])
            .with_temperature(req.temperature)
            .with_max_output_tokens(req.max_tokens)
            .with_stream(req.stream)
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Identity shared by every object of one response
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// Response id
    pub id: String,
    /// Unix timestamp, seconds
    pub created: i64,
    /// Model id as requested
    pub model: String,
}

impl ResponseMeta {
    /// Fresh id with the given prefix (`chatcmpl` or `cmpl`)
    pub fn new(prefix: &str, model: impl Into<String>) -> Self {
        Self {
            id: format!("{prefix}-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }
}

fn zero_usage() -> Value {
    json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0})
}

/// `chat.completion` object
pub fn chat_completion(meta: &ResponseMeta, unit: &CompletionUnit) -> Value {
    json!({
        "id": meta.id,
        "object": "chat.completion",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "message": {"role": unit.role.as_str(), "content": unit.content},
            "finish_reason": unit.finish_reason.as_str(),
        }],
        "usage": zero_usage(),
    })
}

fn chat_delta(meta: &ResponseMeta, chunk: &ChunkUnit) -> Value {
    let mut delta = serde_json::Map::new();
    if let Some(role) = chunk.role {
        delta.insert("role".to_string(), json!(role.as_str()));
    }
    if !chunk.delta_content.is_empty() || chunk.finish_reason.is_none() {
        delta.insert("content".to_string(), json!(chunk.delta_content));
    }
    json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": chunk.finish_reason.map(|f| f.as_str()),
        }],
    })
}

/// In-band stream error object
pub fn stream_error(message: &str) -> Value {
    json!({
        "error": {
            "message": format!("Stream generation failed: {message}"),
            "type": "api_error",
        }
    })
}

/// `chat.completion.chunk` object (upstream chunks pass through unchanged)
pub fn chat_chunk(meta: &ResponseMeta, chunk: StreamChunk) -> Value {
    match chunk {
        StreamChunk::Delta(unit) => chat_delta(meta, &unit),
        StreamChunk::Error { message } => stream_error(&message),
        StreamChunk::Upstream(value) => value,
    }
}

/// `text_completion` object from a local completion
pub fn text_completion(meta: &ResponseMeta, unit: &CompletionUnit) -> Value {
    text_completion_body(meta, &unit.content, unit.finish_reason.as_str(), zero_usage())
}

/// `text_completion` object from an upstream `chat.completion` body
pub fn text_completion_from_upstream(meta: &ResponseMeta, body: &Value) -> Value {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let finish = body
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");
    let usage = body.get("usage").cloned().unwrap_or_else(zero_usage);
    text_completion_body(meta, text, finish, usage)
}

fn text_completion_body(meta: &ResponseMeta, text: &str, finish: &str, usage: Value) -> Value {
    json!({
        "id": meta.id,
        "object": "text_completion",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "text": text,
            "index": 0,
            "logprobs": null,
            "finish_reason": finish,
        }],
        "usage": usage,
    })
}

fn text_chunk_body(meta: &ResponseMeta, text: &str, finish: Option<&str>) -> Value {
    json!({
        "id": meta.id,
        "object": "text_completion.chunk",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "text": text,
            "index": 0,
            "logprobs": null,
            "finish_reason": finish,
        }],
    })
}

/// `text_completion.chunk` object
pub fn text_chunk(meta: &ResponseMeta, chunk: StreamChunk) -> Value {
    match chunk {
        StreamChunk::Delta(unit) => text_chunk_body(
            meta,
            &unit.delta_content,
            unit.finish_reason.map(|f| f.as_str()),
        ),
        StreamChunk::Error { message } => stream_error(&message),
        StreamChunk::Upstream(value) => {
            let text = value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let finish = value
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str);
            text_chunk_body(meta, text, finish)
        }
    }
}

/// `GET /v1/models` body
pub fn model_list(models: &[ModelEntry]) -> Value {
    let data: Vec<Value> = models
        .iter()
        .map(|m| json!({"id": m.id, "object": "model", "owned_by": m.kind}))
        .collect();
    json!({"object": "list", "data": data})
}

/// One SSE frame
pub fn sse_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}
