//! The per-agent tool-calling loop
//!
//! One [`AgentLoop`] carries one subtask to a terminating state: send the
//! message list to the LLM, dispatch any requested tool calls, append their
//! results, and repeat until the model finishes or a guard trips.

mod engine;
mod guards;
mod summarize;
mod tokens;

pub use engine::{AgentLoop, AgentLoopConfig, AgentTaskResult};
pub use guards::{CapOutcome, GuardConfig, GuardState, GuardTrip, iteration_cap_outcome};
pub use summarize::summarize_session;
pub use tokens::{
    AUTO_SUMMARIZE_THRESHOLD, ContextPressure, CRITICAL_THRESHOLD, RoleTotals, TokenTracker, TRUNCATION_THRESHOLD,
    WARNING_THRESHOLD, estimate_tokens,
};

use serde::{Deserialize, Serialize};

use crate::tools::ToolCallStatus;

/// Outcome of a prior subtask, given to dependents for context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorTaskSummary {
    pub task_id: String,
    pub title: String,
    pub success: bool,
    pub summary: String,
}

/// Streaming events surfaced to front-ends while an agent runs
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A streamed token of assistant text
    Token { agent_id: String, text: String },

    ToolStarted {
        agent_id: String,
        call_id: String,
        tool: String,
    },

    ToolCompleted {
        agent_id: String,
        call_id: String,
        tool: String,
        status: ToolCallStatus,
        elapsed_ms: u64,
    },

    /// Context accounting after each LLM call
    Usage {
        agent_id: String,
        context_tokens: u64,
        ratio: f64,
    },
}
