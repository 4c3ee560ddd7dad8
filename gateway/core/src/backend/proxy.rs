//! Remote proxy backend
//!
//! Forwards requests to an OpenAI-compatible `/chat/completions` endpoint and
//! passes the remote's responses through unchanged.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{
    BackendError, ChunkStream, GenerationRequest, GenerationResult, LlmBackend, StreamChunk,
};
use crate::routing::config::ProxyConfig;

/// SSE end-of-stream marker used by OpenAI-compatible servers
const DONE_MARKER: &str = "[DONE]";

/// Backend that relays to a remote OpenAI-compatible service
#[derive(Clone, Debug)]
pub struct ProxyBackend {
    base_url: String,
    api_key: Option<String>,
    model_override: Option<String>,
    http_client: reqwest::Client,
}

impl ProxyBackend {
    /// Build from configuration. Resolves the API key once.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::upstream(format!("failed to build HTTP client: {e}")))?;

        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            warn!(base_url = %config.base_url, "No API key configured for proxy backend");
        }

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model_override: config.model.clone(),
            http_client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let model = self.model_override.as_deref().unwrap_or(&request.model);
        serde_json::json!({
            "model": model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
            "stream": request.stream,
        })
    }

    async fn send(&self, request: &GenerationRequest) -> Result<reqwest::Response, BackendError> {
        let mut builder = self
            .http_client
            .post(self.completions_url())
            .json(&self.build_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::upstream(format!("request to upstream failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::upstream(format!(
                "upstream returned {status}: {}",
                upstream_message(&body)
            )));
        }

        Ok(response)
    }
}

/// Pull the human-readable message out of an OpenAI-style error body
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// What one SSE line means for the stream
#[derive(Debug, PartialEq)]
enum SseLine {
    Chunk(serde_json::Value),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        // Blank separators, comments and event/id fields
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == DONE_MARKER {
        return Ok(SseLine::Done);
    }
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    serde_json::from_str(payload)
        .map(SseLine::Chunk)
        .map_err(|e| BackendError::upstream(format!("malformed upstream chunk: {e}")))
}

/// Splits a byte stream into `\n` terminated lines. Bytes are only decoded
/// once a whole line is buffered, so multi-byte characters may span reads.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String, BackendError>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(decode_line(line))
    }

    /// Whatever is left after the body ended
    fn remainder(&mut self) -> Option<Result<String, BackendError>> {
        if self.buf.is_empty() {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.buf)))
    }
}

fn decode_line(line: Vec<u8>) -> Result<String, BackendError> {
    String::from_utf8(line)
        .map_err(|e| BackendError::upstream(format!("upstream chunk is not valid UTF-8: {e}")))
}

type ChunkSender = mpsc::Sender<Result<StreamChunk, BackendError>>;

/// Report a failure in-band, then end the stream with the error itself
async fn send_failure(tx: &ChunkSender, err: BackendError) {
    warn!(error = %err, "Upstream stream failed");
    let chunk = StreamChunk::Error {
        message: err.message.clone(),
    };
    if tx.send(Ok(chunk)).await.is_ok() {
        let _ = tx.send(Err(err)).await;
    }
}

/// Forward one decoded line. Returns false once the stream is over.
async fn forward_line(tx: &ChunkSender, line: Result<String, BackendError>) -> bool {
    match line.and_then(|line| parse_sse_line(&line)) {
        Ok(SseLine::Chunk(value)) => {
            // a closed receiver means the client went away
            tx.send(Ok(StreamChunk::Upstream(value))).await.is_ok()
        }
        Ok(SseLine::Done) => {
            debug!("Upstream stream complete");
            false
        }
        Ok(SseLine::Skip) => true,
        Err(e) => {
            send_failure(tx, e).await;
            false
        }
    }
}

fn sse_stream(response: reqwest::Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk, BackendError>>(100);
    let mut bytes = response.bytes_stream();

    tokio::spawn(async move {
        let mut lines = LineBuffer::default();

        while let Some(piece) = bytes.next().await {
            match piece {
                Ok(piece) => {
                    lines.push(&piece);
                    while let Some(line) = lines.next_line() {
                        if !forward_line(&tx, line).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let err = BackendError::upstream(format!("upstream stream failed: {e}"));
                    send_failure(&tx, err).await;
                    return;
                }
            }
        }

        // Stream ended without a [DONE] marker; flush a final unterminated line
        if let Some(line) = lines.remainder() {
            forward_line(&tx, line).await;
        }
    });

    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[async_trait]
impl LlmBackend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        debug!(model = %request.model, url = %self.completions_url(), stream = request.stream, "Proxying request");

        let response = self.send(&request).await?;

        if request.stream {
            return Ok(GenerationResult::Stream(sse_stream(response)));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| BackendError::upstream(format!("malformed upstream response: {e}")))?;
        Ok(GenerationResult::Upstream(body))
    }
}
