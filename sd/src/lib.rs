//! swarmd - local multi-agent coding assistant
//!
//! swarmd decomposes a user request into a dependency graph of subtasks and
//! executes them across a pool of isolated worker agents. Each agent drives
//! an iterative "reason, call tool, observe" loop against an LLM endpoint,
//! persisting every step into the durable store so sessions can resume, be
//! searched, and be summarized when context grows.
//!
//! # Core Concepts
//!
//! - **Plan as a DAG**: subtasks run in dependency-ordered parallel phases
//! - **Branch per agent**: each agent works on its own git branch, merged
//!   back with one merge commit per branch
//! - **State in the store**: every message, tool call, and summary persists
//!   in SQLite so nothing lives only in memory
//! - **Guarded loops**: iteration caps, tool-loop detection, and context
//!   budgets force every agent to a terminating state
//!
//! # Modules
//!
//! - [`orchestrator`] - plan execution, agent pool, process isolation
//! - [`agent`] - the per-agent tool-calling loop and its guards
//! - [`llm`] - LLM client trait, Anthropic implementation, retry policy
//! - [`tools`] - atomic tool substrate (write, patch, exec, sessions)
//! - [`index`] - code-symbol indexing with change detection
//! - [`planning`] - request decomposition into a TaskPlan
//! - [`gitops`] - repository and branch management
//! - [`domain`] - plan/subtask types and the plan-file contract
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod agent;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod domain;
pub mod gitops;
pub mod index;
pub mod llm;
pub mod orchestrator;
pub mod planning;
pub mod tools;

// Re-export commonly used types
pub use agent::{AgentEvent, AgentLoop, AgentLoopConfig, AgentTaskResult, ContextPressure, TokenTracker};
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use config::Config;
pub use domain::{Complexity, SubTask, SubTaskStatus, TaskPlan, TaskType, generate_id};
pub use gitops::{GitError, MergeOutcome};
pub use index::{IndexConfig, IndexOutcome, SymbolIndexer};
pub use llm::{
    AnthropicClient, CompletionRequest, CompletionResponse, LlmClient, LlmError, Message, RetryPolicy, StopReason,
    StreamChunk, TokenUsage, ToolCall, ToolDefinition,
};
pub use orchestrator::{
    AgentPool, AgentState, ExecuteOptions, Orchestrator, OrchestratorEvent, OrchestratorResult, TaskOutcome,
};
pub use planning::Decomposer;
pub use tools::{Tool, ToolContext, ToolExecutor, ToolResult};
