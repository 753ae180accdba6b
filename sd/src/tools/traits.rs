//! Tool trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::context::ToolContext;

/// A tool that can be called by the LLM
///
/// Tools never propagate errors across the agent-loop boundary: every
/// outcome, success or failure, is a flat JSON envelope with documented
/// fields and a fixed error code per tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches LLM tool_use name)
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Per-call timeout enforced by the executor
    ///
    /// None means the tool manages its own deadline (process execution).
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    /// Execute the tool
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// JSON envelope text handed back to the LLM
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result from plain text
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Create an error result from plain text
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Create a successful result from a JSON envelope
    pub fn success_json(value: Value) -> Self {
        Self {
            content: value.to_string(),
            is_error: false,
        }
    }

    /// Create an error result from a JSON envelope
    pub fn error_json(value: Value) -> Self {
        Self {
            content: value.to_string(),
            is_error: true,
        }
    }

    /// Parse the envelope back out (for tests and callers)
    pub fn as_json(&self) -> Option<Value> {
        serde_json::from_str(&self.content).ok()
    }
}
