//! LlmClient trait and the scripted mock used by tests

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, LlmError, StreamChunk};

/// Abstract LLM endpoint
///
/// The core needs exactly one capability: send messages plus tool specs, get
/// back an assistant message with optional tool calls and token usage.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One blocking completion call
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion; chunks are forwarded as they arrive and the
    /// assembled response is returned at the end
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}

pub mod mock {
    //! Scripted mock client
    //!
    //! Plays back a fixed list of responses (or errors) in order; panics in
    //! tests that consume more responses than were scripted.

    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::llm::{
        CompletionRequest, CompletionResponse, LlmClient, LlmError, StopReason, StreamChunk, TokenUsage, ToolCall,
    };

    type Scripted = Result<CompletionResponse, LlmError>;

    /// Mock LLM client with scripted responses
    pub struct MockLlmClient {
        responses: Mutex<Vec<Scripted>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<CompletionResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(Ok).rev().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Script a mix of responses and errors
        pub fn scripted(responses: Vec<Scripted>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Requests observed so far
        pub fn seen_requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// A plain end-turn text response
        pub fn text_response(text: &str) -> CompletionResponse {
            CompletionResponse {
                content: Some(text.to_string()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: None,
                    max_context: None,
                },
            }
        }

        /// A response requesting one tool call
        pub fn tool_response(tool: &str, input: serde_json::Value) -> CompletionResponse {
            CompletionResponse {
                content: None,
                tool_calls: vec![ToolCall::new(format!("call_{tool}"), tool, input)],
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: None,
                    max_context: None,
                },
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| panic!("MockLlmClient ran out of scripted responses"))
        }

        async fn stream(
            &self,
            request: CompletionRequest,
            chunk_tx: mpsc::Sender<StreamChunk>,
        ) -> Result<CompletionResponse, LlmError> {
            let response = self.complete(request).await?;
            if let Some(text) = &response.content {
                let _ = chunk_tx.send(StreamChunk::TextDelta(text.clone())).await;
            }
            let _ = chunk_tx
                .send(StreamChunk::MessageDone {
                    stop_reason: response.stop_reason,
                    usage: response.usage.clone(),
                })
                .await;
            Ok(response)
        }
    }
}
