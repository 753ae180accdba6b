//! Context summarization
//!
//! When the context budget crosses the auto-summarize threshold the loop
//! asks a (usually cheaper) model for a compact summary of the session so
//! far, then records it in the store: a new summary message, with every
//! contributing message flagged and linked back to it.

use std::sync::Arc;

use eyre::{Context, Result, eyre};
use tracing::info;

use memstore::{MemoryStore, MessageType};

use crate::cancel::CancelToken;
use crate::llm::{CompletionRequest, LlmClient, Message, RetryPolicy};

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize an AI coding agent's working session. \
     Produce a compact summary that preserves: the task, decisions made, files \
     changed and how, errors encountered, and what remains to be done. \
     Output only the summary text.";

/// Per-message excerpt cap keeps the summarization prompt itself small
const EXCERPT_CHARS: usize = 600;

/// Summarize the session's active context and record it in the store
///
/// Returns the summary text. Every message in the current active context
/// (including any earlier summary) is flagged as contributing.
pub async fn summarize_session(
    llm: &Arc<dyn LlmClient>,
    store: &MemoryStore,
    session_id: &str,
    model: Option<String>,
    max_tokens: u32,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<String> {
    let store_clone = store.clone();
    let sid = session_id.to_string();
    let context = tokio::task::spawn_blocking(move || store_clone.active_context(&sid))
        .await
        .context("Active-context task panicked")??;

    if context.is_empty() {
        return Err(eyre!("nothing to summarize: session has no active context"));
    }

    let mut transcript = String::new();
    for message in &context {
        let text = message.text();
        let excerpt: String = text.chars().take(EXCERPT_CHARS).collect();
        let label = match message.message_type {
            MessageType::Summary => "earlier summary",
            other => other.as_str(),
        };
        transcript.push_str(&format!("[{label}] {excerpt}\n"));
    }

    let request = CompletionRequest {
        system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
        messages: vec![Message::user(format!("Summarize this session:\n\n{transcript}"))],
        tools: vec![],
        max_tokens,
        model: model.clone(),
    };

    let response = retry
        .run(cancel, |_| {
            let request = request.clone();
            async move { llm.complete(request).await }
        })
        .await
        .map_err(|e| eyre!("summarization call failed: {e}"))?;

    let summary_text = response
        .content
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| eyre!("summarizer returned no text"))?;

    let contributing: Vec<String> = context.iter().map(|m| m.id.clone()).collect();
    let store_clone = store.clone();
    let sid = session_id.to_string();
    let text_clone = summary_text.clone();
    let recorded = tokio::task::spawn_blocking(move || {
        store_clone.record_summary(&sid, &text_clone, model.as_deref(), &contributing)
    })
    .await
    .context("Summary-record task panicked")??;

    info!(
        session_id,
        summary_id = %recorded.id,
        summarized = context.len(),
        "Session summarized"
    );
    Ok(summary_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;
    use memstore::{MessageCompletion, NewMessage, NewSession};
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, MemoryStore, String) {
        let temp = tempdir().unwrap();
        let store = MemoryStore::open(temp.path().join("test.db")).unwrap();
        let session = store
            .create_session(NewSession {
                model_id: "claude-sonnet-4".to_string(),
                role: "coder".to_string(),
                ..Default::default()
            })
            .unwrap();
        (temp, store, session.id)
    }

    #[tokio::test]
    async fn test_summarize_records_and_flags() {
        let (_temp, store, sid) = setup().await;

        for i in 0..4 {
            let mut new = NewMessage::of(&sid, MessageType::Assistant);
            new.request_content = Some(format!("step {i}"));
            let msg = store.append_message(new).unwrap();
            store.complete_message(&msg.id, MessageCompletion::default()).unwrap();
        }

        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![MockLlmClient::text_response(
            "did steps 0-3",
        )]));

        let summary = summarize_session(
            &llm,
            &store,
            &sid,
            Some("claude-haiku".to_string()),
            512,
            &RetryPolicy::default(),
            &CancelToken::noop(),
        )
        .await
        .unwrap();

        assert_eq!(summary, "did steps 0-3");

        // Replay collapses to just the summary
        let context = store.active_context(&sid).unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].message_type, MessageType::Summary);
        assert_eq!(context[0].response_content.as_deref(), Some("did steps 0-3"));
    }

    #[tokio::test]
    async fn test_summarize_empty_session_errors() {
        let (_temp, store, sid) = setup().await;

        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(vec![]));
        let result = summarize_session(
            &llm,
            &store,
            &sid,
            None,
            512,
            &RetryPolicy::default(),
            &CancelToken::noop(),
        )
        .await;

        assert!(result.is_err());
    }
}
