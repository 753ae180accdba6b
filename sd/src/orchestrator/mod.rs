//! Task orchestration
//!
//! Executes a TaskPlan under a configured parallelism, failure, and merge
//! policy with durable progress: the dependency scheduler, the agent pool,
//! and the process-isolation transport for child agents.

mod agent_proc;
mod core;
mod events;
mod pool;

pub use agent_proc::{AgentCommand, AgentProcess, ENV_AGENT_ID, ENV_ORCHESTRATED, READY_LINE, serve_agent_mode};
pub use core::{ExecuteOptions, Orchestrator, OrchestratorResult, TaskOutcome};
pub use events::OrchestratorEvent;
pub use pool::{AgentInstance, AgentPool, AgentState};
