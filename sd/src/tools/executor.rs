//! ToolExecutor - registry and dispatch for one agent's tools

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::llm::{ToolCall, ToolDefinition};

use super::builtin::{
    ApplyPatchTool, ListDirectoryTool, ProcessRegistry, ProcessSessionTool, ReadFileTool, RunCommandTool,
    WriteChunkTool, WriteFileTool,
};
use super::{Tool, ToolContext, ToolResult};

/// Terminal status of one tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Everything the agent loop needs to know about one finished call
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub result: ToolResult,
    pub status: ToolCallStatus,
    pub elapsed: Duration,
}

/// Manages tool execution for one agent
pub struct ToolExecutor {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolExecutor {
    /// Create executor with the standard tool set and a private process
    /// registry
    pub fn standard() -> Self {
        Self::with_process_registry(Arc::new(ProcessRegistry::new()))
    }

    /// Create executor sharing an existing background-process registry
    pub fn with_process_registry(registry: Arc<ProcessRegistry>) -> Self {
        let mut tools: HashMap<String, Box<dyn Tool>> = HashMap::new();

        // File system tools
        tools.insert("read_file".into(), Box::new(ReadFileTool));
        tools.insert("write_file".into(), Box::new(WriteFileTool));
        tools.insert("write_chunk".into(), Box::new(WriteChunkTool::new()));
        tools.insert("apply_patch".into(), Box::new(ApplyPatchTool));
        tools.insert("list_directory".into(), Box::new(ListDirectoryTool));

        // Process execution
        tools.insert("run_command".into(), Box::new(RunCommandTool));
        tools.insert("process".into(), Box::new(ProcessSessionTool::new(registry)));

        Self { tools }
    }

    /// Create an empty executor (for testing)
    pub fn empty() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Add a tool to the executor
    pub fn add_tool(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    /// Get definitions for a subset of tools by name
    ///
    /// An empty subset means the full catalog.
    pub fn definitions_for(&self, tool_names: &[String]) -> Vec<ToolDefinition> {
        if tool_names.is_empty() {
            return self.definitions();
        }
        tool_names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Execute one tool call with timeout and cancellation
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let started = Instant::now();

        let (result, status) = if call.truncated {
            // The arguments themselves arrived cut off; running the tool
            // would produce a misleading schema error
            let code = if call.name == "apply_patch" {
                "truncated_patch"
            } else {
                "truncated_content"
            };
            warn!(tool = %call.name, "Tool arguments arrived truncated");
            (
                ToolResult::error_json(json!({
                    "error": code,
                    "message": "tool arguments were truncated mid-stream",
                    "suggestion": "resend the content in smaller pieces with write_chunk",
                })),
                ToolCallStatus::Failed,
            )
        } else if ctx.cancel.is_cancelled() {
            (
                ToolResult::error_json(json!({"error": "cancelled"})),
                ToolCallStatus::Cancelled,
            )
        } else {
            match self.tools.get(&call.name) {
                None => (
                    ToolResult::error_json(json!({
                        "error": "unknown_tool",
                        "tool": call.name,
                    })),
                    ToolCallStatus::Failed,
                ),
                Some(tool) => self.run_tool(tool.as_ref(), call, ctx).await,
            }
        };

        let elapsed = started.elapsed();
        debug!(tool = %call.name, ?status, ?elapsed, "Tool call finished");

        ToolOutcome {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
            status,
            elapsed,
        }
    }

    async fn run_tool(&self, tool: &dyn Tool, call: &ToolCall, ctx: &ToolContext) -> (ToolResult, ToolCallStatus) {
        let mut cancel = ctx.cancel.clone();
        let work = tool.execute(call.input.clone(), ctx);

        let result = match tool.timeout() {
            Some(limit) => {
                tokio::select! {
                    result = work => result,
                    _ = tokio::time::sleep(limit) => {
                        return (
                            ToolResult::error_json(json!({
                                "error": "tool_timeout",
                                "timeout_ms": limit.as_millis() as u64,
                            })),
                            ToolCallStatus::TimedOut,
                        );
                    }
                    _ = cancel.cancelled() => {
                        return (
                            ToolResult::error_json(json!({"error": "cancelled"})),
                            ToolCallStatus::Cancelled,
                        );
                    }
                }
            }
            None => {
                tokio::select! {
                    result = work => result,
                    _ = cancel.cancelled() => {
                        return (
                            ToolResult::error_json(json!({"error": "cancelled"})),
                            ToolCallStatus::Cancelled,
                        );
                    }
                }
            }
        };

        let status = if result.is_error {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        (result, status)
    }

    /// Execute multiple tool calls in the order returned by the model
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(self.execute(call, ctx).await);
        }
        outcomes
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(temp: &tempfile::TempDir) -> ToolContext {
        ToolContext::new(temp.path().to_path_buf(), "test".to_string())
    }

    #[test]
    fn test_standard_executor_has_substrate_tools() {
        let executor = ToolExecutor::standard();

        for name in [
            "read_file",
            "write_file",
            "write_chunk",
            "apply_patch",
            "list_directory",
            "run_command",
            "process",
        ] {
            assert!(executor.has_tool(name), "{name} missing");
        }
    }

    #[test]
    fn test_definitions_for_subset_and_empty() {
        let executor = ToolExecutor::standard();

        let defs = executor.definitions_for(&["read_file".to_string(), "write_file".to_string()]);
        assert_eq!(defs.len(), 2);

        // Empty subset means everything
        let all = executor.definitions_for(&[]);
        assert_eq!(all.len(), executor.tool_names().len());
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let executor = ToolExecutor::standard();
        let temp = tempdir().unwrap();

        let call = ToolCall::new("call_1", "no_such_tool", serde_json::json!({}));
        let outcome = executor.execute(&call, &ctx(&temp)).await;

        assert_eq!(outcome.status, ToolCallStatus::Failed);
        assert_eq!(outcome.result.as_json().unwrap()["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn test_execute_truncated_call() {
        let executor = ToolExecutor::standard();
        let temp = tempdir().unwrap();

        let mut call = ToolCall::new("call_1", "apply_patch", serde_json::json!({}));
        call.truncated = true;
        let outcome = executor.execute(&call, &ctx(&temp)).await;

        assert_eq!(outcome.status, ToolCallStatus::Failed);
        assert_eq!(outcome.result.as_json().unwrap()["error"], "truncated_patch");

        let mut call = ToolCall::new("call_2", "write_file", serde_json::json!({}));
        call.truncated = true;
        let outcome = executor.execute(&call, &ctx(&temp)).await;
        assert_eq!(outcome.result.as_json().unwrap()["error"], "truncated_content");
    }

    #[tokio::test]
    async fn test_execute_cancelled_before_dispatch() {
        let executor = ToolExecutor::standard();
        let temp = tempdir().unwrap();

        let (handle, token) = crate::cancel::cancel_pair();
        handle.cancel();
        let ctx = ToolContext::new(temp.path().to_path_buf(), "test".to_string()).with_cancel(token);

        let call = ToolCall::new("call_1", "read_file", serde_json::json!({"path": "x"}));
        let outcome = executor.execute(&call, &ctx).await;

        assert_eq!(outcome.status, ToolCallStatus::Cancelled);
    }
}
