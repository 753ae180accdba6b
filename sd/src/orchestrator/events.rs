//! Orchestrator events for front-ends

use crate::tools::ToolCallStatus;

/// Progress events emitted while a plan executes
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    AgentStarted {
        agent_id: String,
        task_id: String,
    },

    TaskCompleted {
        task_id: String,
        success: bool,
    },

    /// One dependency-ordered group finished
    PhaseCompleted {
        phase: u32,
        completed: usize,
        failed: usize,
    },

    PlanCompleted {
        plan_id: String,
        success: bool,
    },

    /// Streamed assistant text from an agent
    AgentOutput {
        agent_id: String,
        text: String,
    },

    AgentToolCall {
        agent_id: String,
        tool: String,
    },

    AgentToolProgress {
        agent_id: String,
        tool: String,
        status: ToolCallStatus,
        elapsed_ms: u64,
    },
}
