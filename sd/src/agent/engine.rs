//! AgentLoop - the iterate / dispatch / observe engine
//!
//! Every iteration: preflight the context budget (summarize, then truncate,
//! when over threshold), send the message list with tool specs, dispatch the
//! returned tool calls in order, append their results, repeat. Termination:
//! an assistant turn without tool calls, the completion sentinel, or a guard
//! trip. The loop never returns `Err` to the orchestrator for task-level
//! failures - every outcome is an [`AgentTaskResult`].

use std::sync::Arc;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use memstore::{MemoryStore, MessageCompletion, MessageStatus, MessageType, NewMessage};

use crate::config::Config;
use crate::domain::SubTask;
use crate::llm::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmClient, LlmError, Message, MessageContent, RetryPolicy,
    Role, StopReason, StreamChunk,
};
use crate::tools::{ToolCallStatus, ToolContext, ToolExecutor, ToolOutcome};

use super::guards::{CapOutcome, GuardConfig, GuardState, iteration_cap_outcome};
use super::summarize::summarize_session;
use super::tokens::{ContextPressure, TokenTracker};
use super::{AgentEvent, PriorTaskSummary};

/// Agent loop configuration
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub model: String,

    /// Model used when the subtask asks for deeper reasoning
    pub thinking_model: Option<String>,

    /// Model used for summarization calls
    pub summarizer_model: Option<String>,

    pub max_response_tokens: u32,
    pub max_context_tokens: u64,
    pub guard: GuardConfig,
    pub retry: RetryPolicy,

    /// Phrase the assistant emits to signal completion
    pub completion_sentinel: String,

    /// Test hook: overrides the complexity-derived iteration cap
    pub max_iterations_override: Option<u32>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            thinking_model: None,
            summarizer_model: None,
            max_response_tokens: 16384,
            max_context_tokens: 200_000,
            guard: GuardConfig::default(),
            retry: RetryPolicy::default(),
            completion_sentinel: "TASK COMPLETE".to_string(),
            max_iterations_override: None,
        }
    }
}

impl AgentLoopConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm.model.clone(),
            thinking_model: Some(config.llm.thinking_model.clone()),
            summarizer_model: Some(config.llm.summarizer_model.clone()),
            max_response_tokens: config.llm.max_tokens,
            max_context_tokens: config.agent.max_context_tokens,
            guard: GuardConfig {
                tool_loop_window: config.agent.tool_loop_window,
                consecutive_failure_limit: config.agent.consecutive_failure_limit,
            },
            ..Default::default()
        }
    }
}

/// Terminal outcome of one subtask run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub success: bool,

    /// Set when the task succeeded with a caveat (iteration cap)
    pub warning: Option<String>,

    /// Guard or cancellation reason when the task was cut short
    pub bailout_reason: Option<String>,

    pub error: Option<String>,
    pub final_text: String,
    pub iterations: u32,
    pub context_tokens: u64,
    pub completion_tokens: u64,
    pub cancelled: bool,
}

/// Snapshot of loop state used to build results
struct RunState {
    task_id: String,
    agent_id: String,
    session_id: Option<String>,
    iterations: u32,
}

impl RunState {
    fn result(&self, tokens: &TokenTracker) -> AgentTaskResult {
        AgentTaskResult {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            success: false,
            warning: None,
            bailout_reason: None,
            error: None,
            final_text: String::new(),
            iterations: self.iterations,
            context_tokens: tokens.context_size(),
            completion_tokens: tokens.completion_total(),
            cancelled: false,
        }
    }

    fn success(&self, tokens: &TokenTracker, final_text: String, warning: Option<String>) -> AgentTaskResult {
        AgentTaskResult {
            success: true,
            warning,
            final_text,
            ..self.result(tokens)
        }
    }

    fn failure(&self, tokens: &TokenTracker, bailout: &str, error: String) -> AgentTaskResult {
        AgentTaskResult {
            bailout_reason: Some(bailout.to_string()),
            error: Some(error),
            ..self.result(tokens)
        }
    }

    fn cancelled(&self, tokens: &TokenTracker) -> AgentTaskResult {
        AgentTaskResult {
            cancelled: true,
            bailout_reason: Some("cancelled".to_string()),
            ..self.result(tokens)
        }
    }
}

/// The per-agent loop engine
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    store: MemoryStore,
    tools: ToolExecutor,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(llm: Arc<dyn LlmClient>, store: MemoryStore, tools: ToolExecutor, config: AgentLoopConfig) -> Self {
        Self {
            llm,
            store,
            tools,
            config,
        }
    }

    /// Carry one subtask to a terminating state
    pub async fn run(
        &self,
        task: &SubTask,
        original_request: &str,
        prior: &[PriorTaskSummary],
        ctx: &ToolContext,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> AgentTaskResult {
        match self.run_inner(task, original_request, prior, ctx, events).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Agent loop infrastructure failure");
                AgentTaskResult {
                    task_id: task.id.clone(),
                    agent_id: ctx.agent_id.clone(),
                    session_id: None,
                    success: false,
                    warning: None,
                    bailout_reason: Some("infrastructure_error".to_string()),
                    error: Some(e.to_string()),
                    final_text: String::new(),
                    iterations: 0,
                    context_tokens: 0,
                    completion_tokens: 0,
                    cancelled: false,
                }
            }
        }
    }

    async fn run_inner(
        &self,
        task: &SubTask,
        original_request: &str,
        prior: &[PriorTaskSummary],
        ctx: &ToolContext,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<AgentTaskResult> {
        let model = self.model_for(task);
        let max_iterations = self
            .config
            .max_iterations_override
            .unwrap_or_else(|| task.complexity.max_iterations());

        let session = self
            .store_call({
                let agent_id = ctx.agent_id.clone();
                let model = model.clone();
                let title = task.title.clone();
                let work_dir = ctx.work_dir.display().to_string();
                move |store| {
                    store.create_session(memstore::NewSession {
                        agent_id: Some(agent_id),
                        model_id: model,
                        role: "coder".to_string(),
                        title: Some(title),
                        work_directory: Some(work_dir),
                        ..Default::default()
                    })
                }
            })
            .await?;

        let mut state = RunState {
            task_id: task.id.clone(),
            agent_id: ctx.agent_id.clone(),
            session_id: Some(session.id.clone()),
            iterations: 0,
        };

        let system_prompt = self.build_system_prompt(task, ctx);
        let mut messages = vec![Message::user(build_task_prompt(task, original_request, prior))];
        let mut tokens = TokenTracker::new(self.config.max_context_tokens);
        let mut guards = GuardState::new(self.config.guard.clone());

        info!(
            task_id = %task.id,
            agent_id = %ctx.agent_id,
            session_id = %session.id,
            model = %model,
            max_iterations,
            "Agent loop starting"
        );

        loop {
            if state.iterations >= max_iterations {
                return Ok(self.finish_at_cap(&state, &tokens, &guards, max_iterations));
            }
            state.iterations += 1;

            if ctx.cancel.is_cancelled() {
                return Ok(state.cancelled(&tokens));
            }

            self.preflight_context(&session.id, task, &mut messages, &mut tokens, &system_prompt, ctx)
                .await;

            // Persist the assistant turn before the call so a crash is visible
            let turn_id = self
                .store_call({
                    let session_id = session.id.clone();
                    let model = model.clone();
                    let iteration = state.iterations as i64;
                    move |store| {
                        let mut new = NewMessage::of(&session_id, MessageType::Assistant);
                        new.model_id = Some(model);
                        new.iteration_number = Some(iteration);
                        new.max_iterations = Some(max_iterations as i64);
                        store.append_message(new).map(|m| m.id)
                    }
                })
                .await?;

            let request = CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: self.tools.definitions_for(&task.required_tools),
                max_tokens: self.config.max_response_tokens,
                model: Some(model.clone()),
            };

            let response = match self.call_llm(request, ctx, &events).await {
                Ok(response) => response,
                Err(LlmError::Cancelled) => {
                    self.fail_stored_message(&turn_id, MessageStatus::Cancelled, "cancelled", Some("cancelled"))
                        .await;
                    return Ok(state.cancelled(&tokens));
                }
                Err(e) => {
                    self.fail_stored_message(&turn_id, MessageStatus::Failed, &e.to_string(), Some("llm_transport"))
                        .await;
                    return Ok(state.failure(&tokens, "llm_transport", e.to_string()));
                }
            };

            tokens.record(&response.usage);
            tokens.add_role_tokens("assistant", response.usage.completion_tokens);
            if let Some(events) = &events {
                let _ = events
                    .send(AgentEvent::Usage {
                        agent_id: ctx.agent_id.clone(),
                        context_tokens: tokens.context_size(),
                        ratio: tokens.usage_ratio(),
                    })
                    .await;
            }

            let content_text = response.content.clone().unwrap_or_default();
            self.store_call({
                let turn_id = turn_id.clone();
                let content = content_text.clone();
                let usage = response.usage.clone();
                move |store| {
                    store.complete_message(
                        &turn_id,
                        MessageCompletion {
                            response_content: Some(content),
                            prompt_tokens: Some(usage.prompt_tokens as i64),
                            completion_tokens: Some(usage.completion_tokens as i64),
                            total_tokens: Some(usage.context_total() as i64),
                            ..Default::default()
                        },
                    )
                }
            })
            .await?;

            // Truncated output without tool calls: ask the model to continue
            if response.stop_reason == StopReason::MaxTokens && response.tool_calls.is_empty() {
                messages.push(Message::assistant(content_text));
                messages.push(Message::user(
                    "Continue from where you left off. Your previous response was truncated.",
                ));
                continue;
            }

            if response.tool_calls.is_empty() {
                info!(task_id = %task.id, iterations = state.iterations, "Agent loop complete");
                return Ok(state.success(&tokens, content_text, None));
            }

            let sentinel_hit = content_text.contains(&self.config.completion_sentinel);
            messages.push(build_assistant_message(&response));

            let mut result_blocks = Vec::new();
            for call in &response.tool_calls {
                if ctx.cancel.is_cancelled() {
                    return Ok(state.cancelled(&tokens));
                }

                if let Some(trip) = guards.record_tool_call(&call.name, &call.input) {
                    self.record_guard_trip(&session.id, call, trip.bailout_reason(), &trip.message())
                        .await;
                    return Ok(state.failure(&tokens, trip.bailout_reason(), trip.message()));
                }

                if let Some(events) = &events {
                    let _ = events
                        .send(AgentEvent::ToolStarted {
                            agent_id: ctx.agent_id.clone(),
                            call_id: call.id.clone(),
                            tool: call.name.clone(),
                        })
                        .await;
                }

                let tool_msg_id = self
                    .store_call({
                        let session_id = session.id.clone();
                        let tool = call.name.clone();
                        let args = call.input.to_string();
                        let iteration = state.iterations as i64;
                        move |store| {
                            let mut new = NewMessage::of(&session_id, MessageType::ToolCall);
                            new.tool_name = Some(tool);
                            new.tool_args = Some(args);
                            new.iteration_number = Some(iteration);
                            store.append_message(new).map(|m| m.id)
                        }
                    })
                    .await?;

                let outcome = self.tools.execute(call, ctx).await;
                self.persist_tool_outcome(&tool_msg_id, &outcome).await;

                if let Some(events) = &events {
                    let _ = events
                        .send(AgentEvent::ToolCompleted {
                            agent_id: ctx.agent_id.clone(),
                            call_id: outcome.call_id.clone(),
                            tool: outcome.tool_name.clone(),
                            status: outcome.status,
                            elapsed_ms: outcome.elapsed.as_millis() as u64,
                        })
                        .await;
                }

                result_blocks.push(ContentBlock::tool_result(
                    &outcome.call_id,
                    &outcome.result.content,
                    outcome.result.is_error,
                ));

                if outcome.status == ToolCallStatus::Cancelled {
                    return Ok(state.cancelled(&tokens));
                }

                let failed = outcome.status != ToolCallStatus::Completed;
                if let Some(trip) = guards.record_tool_result(failed) {
                    return Ok(state.failure(&tokens, trip.bailout_reason(), trip.message()));
                }
            }
            messages.push(Message::user_blocks(result_blocks));

            if sentinel_hit {
                info!(task_id = %task.id, iterations = state.iterations, "Completion sentinel observed");
                return Ok(state.success(&tokens, content_text, None));
            }

            // Keep the estimate current when the provider reported nothing
            if response.usage.context_total() == 0 {
                let chars = system_prompt.len() + messages.iter().map(|m| m.char_len()).sum::<usize>();
                tokens.estimate_from_chars(chars);
            }
        }
    }

    fn model_for(&self, task: &SubTask) -> String {
        if task.use_thinking_model {
            self.config.thinking_model.clone().unwrap_or_else(|| self.config.model.clone())
        } else {
            self.config.model.clone()
        }
    }

    fn finish_at_cap(
        &self,
        state: &RunState,
        tokens: &TokenTracker,
        guards: &GuardState,
        max_iterations: u32,
    ) -> AgentTaskResult {
        match iteration_cap_outcome(tokens.usage_ratio(), guards.tripped().is_some()) {
            CapOutcome::SuccessWithWarning => {
                warn!(task_id = %state.task_id, max_iterations, "Iteration cap reached; reporting success with warning");
                state.success(
                    tokens,
                    String::new(),
                    Some(format!("iteration cap of {max_iterations} reached")),
                )
            }
            CapOutcome::HardFailure => state.failure(
                tokens,
                "iteration_cap",
                format!("iteration cap of {max_iterations} exceeded"),
            ),
        }
    }

    /// Summarize and/or truncate before the next call when over budget
    async fn preflight_context(
        &self,
        session_id: &str,
        task: &SubTask,
        messages: &mut Vec<Message>,
        tokens: &mut TokenTracker,
        system_prompt: &str,
        ctx: &ToolContext,
    ) {
        match tokens.pressure() {
            ContextPressure::Normal => return,
            ContextPressure::Warning => {
                debug!(ratio = tokens.usage_ratio(), "Context usage past warning threshold");
                return;
            }
            ContextPressure::Critical => {
                warn!(ratio = tokens.usage_ratio(), "Context usage critical");
                return;
            }
            ContextPressure::Summarize | ContextPressure::Truncate => {}
        }

        match summarize_session(
            &self.llm,
            &self.store,
            session_id,
            self.config.summarizer_model.clone(),
            self.config.max_response_tokens.min(2048),
            &self.config.retry,
            &ctx.cancel,
        )
        .await
        {
            Ok(summary) => {
                // Restart the in-memory conversation from the summary
                *messages = vec![Message::user(format!(
                    "Task: {}\n\nSummary of the work so far:\n{}\n\nContinue from here.",
                    task.title, summary
                ))];
                let chars = system_prompt.len() + messages.iter().map(|m| m.char_len()).sum::<usize>();
                tokens.estimate_from_chars(chars);
            }
            Err(e) => {
                warn!(error = %e, "Summarization failed; falling back to truncation");
            }
        }

        // Still over the truncation threshold: drop oldest messages
        while tokens.pressure() >= ContextPressure::Truncate && messages.len() > 1 {
            messages.remove(0);
            while messages.len() > 1 {
                let drop_front = match &messages[0] {
                    Message { role: Role::Assistant, .. } => true,
                    Message {
                        content: MessageContent::Blocks(blocks),
                        ..
                    } => blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })),
                    _ => false,
                };
                if drop_front {
                    messages.remove(0);
                } else {
                    break;
                }
            }
            let chars = system_prompt.len() + messages.iter().map(|m| m.char_len()).sum::<usize>();
            tokens.estimate_from_chars(chars);
        }
    }

    async fn call_llm(
        &self,
        request: CompletionRequest,
        ctx: &ToolContext,
        events: &Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<CompletionResponse, LlmError> {
        let llm = self.llm.clone();
        let events = events.clone();
        let agent_id = ctx.agent_id.clone();

        self.config
            .retry
            .run(&ctx.cancel, move |_| {
                let request = request.clone();
                let llm = llm.clone();
                let events = events.clone();
                let agent_id = agent_id.clone();
                async move {
                    match events {
                        Some(events) => {
                            let (tx, mut rx) = mpsc::channel(64);
                            let forwarder = tokio::spawn(async move {
                                while let Some(chunk) = rx.recv().await {
                                    if let StreamChunk::TextDelta(text) = chunk {
                                        let _ = events
                                            .send(AgentEvent::Token {
                                                agent_id: agent_id.clone(),
                                                text,
                                            })
                                            .await;
                                    }
                                }
                            });
                            let result = llm.stream(request, tx).await;
                            let _ = forwarder.await;
                            result
                        }
                        None => llm.complete(request).await,
                    }
                }
            })
            .await
    }

    fn build_system_prompt(&self, task: &SubTask, ctx: &ToolContext) -> String {
        format!(
            "You are a coding agent working on one subtask of a larger plan.\n\
             Working directory: {}\n\
             Task type: {:?}\n\
             Use the available tools to complete the task. When the task is fully \
             done, finish your reply with the exact phrase {}.",
            ctx.work_dir.display(),
            task.task_type,
            self.config.completion_sentinel
        )
    }

    async fn persist_tool_outcome(&self, message_id: &str, outcome: &ToolOutcome) {
        let store_result = match outcome.status {
            ToolCallStatus::Completed => {
                self.store_call({
                    let id = message_id.to_string();
                    let result = outcome.result.content.clone();
                    move |store| {
                        store.complete_message(
                            &id,
                            MessageCompletion {
                                tool_result: Some(result),
                                ..Default::default()
                            },
                        )
                    }
                })
                .await
            }
            ToolCallStatus::Failed => {
                self.fail_stored_message(message_id, MessageStatus::Failed, &outcome.result.content, None)
                    .await;
                Ok(())
            }
            ToolCallStatus::TimedOut => {
                self.fail_stored_message(message_id, MessageStatus::Timeout, "tool timed out", Some("tool_timeout"))
                    .await;
                Ok(())
            }
            ToolCallStatus::Cancelled => {
                self.fail_stored_message(message_id, MessageStatus::Cancelled, "cancelled", Some("cancelled"))
                    .await;
                Ok(())
            }
        };

        if let Err(e) = store_result {
            warn!(message_id, error = %e, "Failed to persist tool outcome");
        }
    }

    async fn record_guard_trip(&self, session_id: &str, call: &crate::llm::ToolCall, bailout: &str, message: &str) {
        let appended = self
            .store_call({
                let session_id = session_id.to_string();
                let tool = call.name.clone();
                let args = call.input.to_string();
                move |store| {
                    let mut new = NewMessage::of(&session_id, MessageType::ToolCall);
                    new.tool_name = Some(tool);
                    new.tool_args = Some(args);
                    store.append_message(new).map(|m| m.id)
                }
            })
            .await;

        if let Ok(id) = appended {
            self.fail_stored_message(&id, MessageStatus::Failed, message, Some(bailout)).await;
        }
    }

    async fn fail_stored_message(
        &self,
        message_id: &str,
        status: MessageStatus,
        error: &str,
        bailout: Option<&str>,
    ) {
        let result = self
            .store_call({
                let id = message_id.to_string();
                let error = error.to_string();
                let bailout = bailout.map(str::to_string);
                move |store| store.fail_message(&id, status, &error, bailout.as_deref())
            })
            .await;
        if let Err(e) = result {
            warn!(message_id, error = %e, "Failed to persist message failure");
        }
    }

    /// Run a blocking store operation off the async path
    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(MemoryStore) -> memstore::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        let value = tokio::task::spawn_blocking(move || f(store))
            .await
            .context("Store task panicked")??;
        Ok(value)
    }
}

/// Assistant message carrying both text and tool_use blocks
fn build_assistant_message(response: &CompletionResponse) -> Message {
    let mut blocks = Vec::new();
    if let Some(text) = &response.content {
        blocks.push(ContentBlock::text(text));
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    Message::assistant_blocks(blocks)
}

/// Initial user prompt: the subtask plus its surrounding plan context
fn build_task_prompt(task: &SubTask, original_request: &str, prior: &[PriorTaskSummary]) -> String {
    let mut prompt = format!(
        "Overall request:\n{}\n\nYour subtask: {}\n{}\n",
        original_request, task.title, task.description
    );

    if !task.files_affected.is_empty() {
        prompt.push_str(&format!("\nFiles likely affected: {}\n", task.files_affected.join(", ")));
    }

    if !prior.is_empty() {
        prompt.push_str("\nResults of earlier subtasks:\n");
        for p in prior {
            let status = if p.success { "completed" } else { "failed" };
            prompt.push_str(&format!("- [{status}] {}: {}\n", p.title, p.summary));
        }
    }

    if let Some(last_error) = &task.last_error
        && task.retry_count > 0
    {
        prompt.push_str(&format!(
            "\nThis is retry {} of this subtask. The previous attempt failed with:\n{}\n",
            task.retry_count, last_error
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Complexity;
    use crate::llm::client::mock::MockLlmClient;
    use serde_json::json;
    use tempfile::tempdir;

    fn task() -> SubTask {
        SubTask::with_id("task-1", "Write greeting", "Create hello.txt saying hi").with_complexity(Complexity::Trivial)
    }

    fn engine(llm: MockLlmClient, temp: &tempfile::TempDir, config: AgentLoopConfig) -> AgentLoop {
        let store = MemoryStore::open(temp.path().join("agent.db")).unwrap();
        AgentLoop::new(Arc::new(llm), store, ToolExecutor::standard(), config)
    }

    fn work_ctx(temp: &tempfile::TempDir) -> ToolContext {
        let work = temp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        ToolContext::new(work, "agent-1".to_string())
    }

    #[tokio::test]
    async fn test_terminal_text_response() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("all done. TASK COMPLETE")]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let result = engine.run(&task(), "say hi", &[], &work_ctx(&temp), None).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.iterations, 1);
        assert!(result.final_text.contains("TASK COMPLETE"));
        assert!(result.session_id.is_some());
    }

    #[tokio::test]
    async fn test_tool_call_then_completion() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![
            MockLlmClient::tool_response("write_file", json!({"path": "hello.txt", "content": "hi\n"})),
            MockLlmClient::text_response("TASK COMPLETE"),
        ]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());
        let ctx = work_ctx(&temp);

        let result = engine.run(&task(), "say hi", &[], &ctx, None).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.iterations, 2);
        assert_eq!(
            std::fs::read_to_string(ctx.work_dir.join("hello.txt")).unwrap(),
            "hi\n"
        );

        // The tool call is persisted in the session
        let messages = engine.store.session_messages(result.session_id.as_ref().unwrap()).unwrap();
        assert!(
            messages
                .iter()
                .any(|m| m.message_type == MessageType::ToolCall && m.tool_name.as_deref() == Some("write_file"))
        );
    }

    #[tokio::test]
    async fn test_tool_loop_guard_trips_at_three() {
        let temp = tempdir().unwrap();
        let same = json!({"path": "same.txt"});
        let llm = MockLlmClient::new(vec![
            MockLlmClient::tool_response("read_file", same.clone()),
            MockLlmClient::tool_response("read_file", same.clone()),
            MockLlmClient::tool_response("read_file", same.clone()),
        ]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let result = engine.run(&task(), "loop", &[], &work_ctx(&temp), None).await;

        assert!(!result.success);
        assert_eq!(result.bailout_reason.as_deref(), Some("tool_loop"));
        assert!(result.error.unwrap().contains("tool call loop"));
    }

    #[tokio::test]
    async fn test_consecutive_failures_guard() {
        let temp = tempdir().unwrap();
        // Different args each time so the loop detector stays quiet
        let llm = MockLlmClient::new(vec![
            MockLlmClient::tool_response("read_file", json!({"path": "a.txt"})),
            MockLlmClient::tool_response("read_file", json!({"path": "b.txt"})),
            MockLlmClient::tool_response("read_file", json!({"path": "c.txt"})),
        ]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let result = engine.run(&task(), "read missing files", &[], &work_ctx(&temp), None).await;

        assert!(!result.success);
        assert_eq!(result.bailout_reason.as_deref(), Some("consecutive_tool_failures"));
    }

    #[tokio::test]
    async fn test_iteration_cap_soft_success() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![
            MockLlmClient::tool_response("list_directory", json!({"depth": 1})),
            MockLlmClient::tool_response("list_directory", json!({"depth": 2})),
        ]);
        let config = AgentLoopConfig {
            max_iterations_override: Some(2),
            ..Default::default()
        };
        let engine = engine(llm, &temp, config);

        let result = engine.run(&task(), "explore", &[], &work_ctx(&temp), None).await;

        // Context is healthy and no guard tripped: success with warning
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert!(result.warning.unwrap().contains("iteration cap"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let (handle, token) = crate::cancel::cancel_pair();
        handle.cancel();
        let ctx = work_ctx(&temp).with_cancel(token);

        let result = engine.run(&task(), "cancelled", &[], &ctx, None).await;

        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_summarization_preflight() {
        let temp = tempdir().unwrap();
        // Tiny window: the first call's usage (100 + 20) blows straight past it
        let llm = MockLlmClient::new(vec![
            MockLlmClient::tool_response("list_directory", json!({"depth": 1})),
            MockLlmClient::text_response("compact summary of iteration one"),
            MockLlmClient::text_response("TASK COMPLETE"),
        ]);
        let config = AgentLoopConfig {
            max_context_tokens: 100,
            ..Default::default()
        };
        let engine = engine(llm, &temp, config);

        let result = engine.run(&task(), "summarize me", &[], &work_ctx(&temp), None).await;

        assert!(result.success, "{:?}", result.error);

        let session_id = result.session_id.unwrap();
        let messages = engine.store.session_messages(&session_id).unwrap();
        let summary = messages
            .iter()
            .find(|m| m.message_type == MessageType::Summary)
            .expect("summary recorded");
        assert_eq!(
            summary.response_content.as_deref(),
            Some("compact summary of iteration one")
        );

        // Contributing messages are flagged and linked
        let flagged = messages.iter().filter(|m| m.is_summarized).count();
        assert!(flagged > 0);
        for m in messages.iter().filter(|m| m.is_summarized) {
            assert_eq!(m.summary_id.as_deref(), Some(summary.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_after_retries_fails_task() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::scripted(vec![Err(LlmError::ApiError {
            status: 401,
            message: "unauthorized".to_string(),
        })]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let result = engine.run(&task(), "fail", &[], &work_ctx(&temp), None).await;

        assert!(!result.success);
        assert_eq!(result.bailout_reason.as_deref(), Some("llm_transport"));
    }

    #[tokio::test]
    async fn test_streaming_events_forwarded() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("hello TASK COMPLETE")]);
        let engine = engine(llm, &temp, AgentLoopConfig::default());

        let (tx, mut rx) = mpsc::channel(32);
        let result = engine.run(&task(), "stream", &[], &work_ctx(&temp), Some(tx)).await;
        assert!(result.success);

        let mut saw_token = false;
        let mut saw_usage = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::Token { text, .. } => {
                    assert!(text.contains("hello"));
                    saw_token = true;
                }
                AgentEvent::Usage { .. } => saw_usage = true,
                _ => {}
            }
        }
        assert!(saw_token);
        assert!(saw_usage);
    }

    #[test]
    fn test_task_prompt_includes_retry_error() {
        let mut t = task();
        t.retry_count = 1;
        t.last_error = Some("tests failed: 2 assertions".to_string());

        let prompt = build_task_prompt(&t, "original", &[]);
        assert!(prompt.contains("retry 1"));
        assert!(prompt.contains("tests failed"));
    }

    #[test]
    fn test_task_prompt_includes_prior_results() {
        let prior = vec![PriorTaskSummary {
            task_id: "t0".to_string(),
            title: "Set up schema".to_string(),
            success: true,
            summary: "created tables".to_string(),
        }];
        let prompt = build_task_prompt(&task(), "original", &prior);
        assert!(prompt.contains("[completed] Set up schema"));
    }
}
