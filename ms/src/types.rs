//! Store entity types
//!
//! Sessions, messages, and code symbols as persisted rows. Cross-references
//! (parent message, summary message, symbol parent) are by id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted LLM conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    /// Owning agent instance, if any
    pub agent_id: Option<String>,

    pub system_prompt: Option<String>,
    pub model_id: String,

    /// Session role: main, planner, coder, ...
    pub role: String,

    pub title: Option<String>,
    pub work_directory: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,

    /// Opaque JSON blob for front-ends
    pub metadata: Option<String>,
}

/// Kind of a message within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Delegation,
    Summary,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::ToolCall => "tool_call",
            MessageType::ToolResult => "tool_result",
            MessageType::Delegation => "delegation",
            MessageType::Summary => "summary",
            MessageType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageType::User),
            "assistant" => Some(MessageType::Assistant),
            "tool_call" => Some(MessageType::ToolCall),
            "tool_result" => Some(MessageType::ToolResult),
            "delegation" => Some(MessageType::Delegation),
            "summary" => Some(MessageType::Summary),
            "system" => Some(MessageType::System),
            _ => None,
        }
    }
}

/// Lifecycle status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Running => "running",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "running" => Some(MessageStatus::Running),
            "completed" => Some(MessageStatus::Completed),
            "failed" => Some(MessageStatus::Failed),
            "cancelled" => Some(MessageStatus::Cancelled),
            "timeout" => Some(MessageStatus::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses can no longer transition
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Pending | MessageStatus::Running)
    }
}

/// A single step in a session
///
/// One row per user turn, assistant turn, tool call/result, delegation,
/// summary, or system message. Completed exactly once; later may be marked
/// summarized with `summary_id` pointing at the summary that replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,

    /// Parent message for sub-agent hierarchy, same session
    pub parent_message_id: Option<String>,

    pub message_type: MessageType,
    pub agent_role: Option<String>,

    /// 0 = main agent, >= 1 = sub-agent depth
    pub agent_depth: i64,

    pub model_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub request_content: Option<String>,
    pub response_content: Option<String>,
    pub response_summary: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<String>,
    pub tool_result: Option<String>,

    /// JSON arrays of paths
    pub files_modified: Option<String>,
    pub files_created: Option<String>,

    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub iteration_number: Option<i64>,
    pub max_iterations: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub bailout_reason: Option<String>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub is_summarized: bool,
    pub summary_id: Option<String>,
    pub metadata: Option<String>,
}

impl Message {
    /// Text considered for context reconstruction and search
    pub fn text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(req) = &self.request_content {
            parts.push(req.as_str());
        }
        if let Some(resp) = &self.response_content {
            parts.push(resp.as_str());
        }
        parts.join("\n")
    }
}

/// A code definition discovered by indexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSymbol {
    pub id: String,
    pub name: String,

    /// Qualified name, e.g. `module::Type::method`
    pub full_name: String,

    /// class / struct / enum / function / method / const / ...
    pub kind: String,

    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub column_start: i64,
    pub signature: Option<String>,
    pub documentation: Option<String>,

    /// Enclosing symbol for nested definitions
    pub parent_id: Option<String>,

    pub visibility: Option<String>,
    pub is_static: bool,
    pub return_type: Option<String>,
    pub last_indexed: DateTime<Utc>,
}

/// Kind of a context memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Decision,
    Pattern,
    Preference,
    Note,
    Error,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Decision => "decision",
            ContextKind::Pattern => "pattern",
            ContextKind::Preference => "preference",
            ContextKind::Note => "note",
            ContextKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(ContextKind::Decision),
            "pattern" => Some(ContextKind::Pattern),
            "preference" => Some(ContextKind::Preference),
            "note" => Some(ContextKind::Note),
            "error" => Some(ContextKind::Error),
            _ => None,
        }
    }
}
