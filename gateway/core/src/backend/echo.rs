//! Echo backend
//!
//! Returns a fixed three-fragment reply without touching the network. Useful
//! for smoke-testing clients against the gateway.

use async_trait::async_trait;
use futures::stream;

use super::traits::{
    BackendError, ChunkUnit, CompletionUnit, FinishReason, GenerationRequest, GenerationResult,
    LlmBackend, StreamChunk,
};

/// Fragments of the canned reply, in order
pub const ECHO_FRAGMENTS: [&str; 3] = ["🤣", "👉🏻", "🤡"];

/// Backend that always answers with [`ECHO_FRAGMENTS`]
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoBackend;

impl EchoBackend {
    /// Create the echo backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// The whole canned reply
    #[must_use]
    pub fn reply() -> String {
        ECHO_FRAGMENTS.concat()
    }

    fn chunks() -> Vec<Result<StreamChunk, BackendError>> {
        let last = ECHO_FRAGMENTS.len() - 1;
        ECHO_FRAGMENTS
            .iter()
            .enumerate()
            .map(|(i, fragment)| {
                let chunk = ChunkUnit::delta(*fragment, i == 0);
                let chunk = if i == last {
                    chunk.finishing(FinishReason::Stop)
                } else {
                    chunk
                };
                Ok(StreamChunk::Delta(chunk))
            })
            .collect()
    }
}

#[async_trait]
impl LlmBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, BackendError> {
        if request.stream {
            Ok(GenerationResult::Stream(Box::pin(stream::iter(Self::chunks()))))
        } else {
            Ok(GenerationResult::Completion(CompletionUnit::assistant(
                Self::reply(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::messages::{Message, MessageRole};

    fn request(stream: bool) -> GenerationRequest {
        GenerationRequest::new("echo-test", vec![Message::user("Hello")]).with_stream(stream)
    }

    #[tokio::test]
    async fn test_non_streaming_reply() {
        let result = EchoBackend::new().generate(request(false)).await.unwrap();

        match result {
            GenerationResult::Completion(unit) => {
                assert_eq!(unit.content, "🤣👉🏻🤡");
                assert_eq!(unit.role, MessageRole::Assistant);
                assert_eq!(unit.finish_reason, FinishReason::Stop);
            }
            other => panic!("Expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_reply() {
        let result = EchoBackend::new().generate(request(true)).await.unwrap();
        let GenerationResult::Stream(stream) = result else {
            panic!("Expected stream");
        };

        let chunks: Vec<ChunkUnit> = stream
            .map(|item| match item.unwrap() {
                StreamChunk::Delta(chunk) => chunk,
                other => panic!("Unexpected chunk {other:?}"),
            })
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta_content, "🤣");
        assert_eq!(chunks[0].role, Some(MessageRole::Assistant));
        assert!(chunks[0].is_first);
        assert_eq!(chunks[1].delta_content, "👉🏻");
        assert!(chunks[1].role.is_none());
        assert!(chunks[1].finish_reason.is_none());
        assert_eq!(chunks[2].delta_content, "🤡");
        assert_eq!(chunks[2].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_ignores_request_content() {
        let request = GenerationRequest::new("anything", vec![Message::system("be terse")]);
        let result = EchoBackend::new().generate(request).await.unwrap();
        assert!(matches!(result, GenerationResult::Completion(u) if u.content == EchoBackend::reply()));
    }
}
