//! Orchestrator - executes a TaskPlan to completion
//!
//! Dependency-ordered groups run concurrently, bounded by the agent pool.
//! Each subtask gets a worktree on its own agent branch; completed branches
//! are merged back with one merge commit each. Task failure never aborts the
//! orchestration - it only blocks dependents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use memstore::MemoryStore;

use crate::agent::{AgentEvent, AgentLoop, AgentLoopConfig, AgentTaskResult, PriorTaskSummary};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::domain::{SubTaskStatus, TaskPlan, save_plan_with_retry};
use crate::gitops;
use crate::index::SymbolIndexer;
use crate::llm::LlmClient;
use crate::tools::{ProcessRegistry, ToolContext, ToolExecutor};

use super::agent_proc::{AgentCommand, AgentProcess};
use super::events::OrchestratorEvent;
use super::pool::AgentPool;

const AGENT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for one plan execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub max_agents: usize,
    pub agent_timeout: Duration,
    pub use_process_isolation: bool,
    pub auto_merge_results: bool,

    /// Ask agents to keep the test suite green before declaring success
    pub require_tests_pass: bool,

    pub retry_failed: bool,
    pub skip_failed: bool,
    pub max_retries: u32,

    /// Where to persist plan state; nothing is written when unset
    pub plan_path: Option<PathBuf>,

    /// Base ref for the orchestration branch (default: current HEAD)
    pub base_branch: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_agents: 4,
            agent_timeout: Duration::from_secs(30 * 60),
            use_process_isolation: false,
            auto_merge_results: true,
            require_tests_pass: false,
            retry_failed: false,
            skip_failed: false,
            max_retries: 2,
            plan_path: None,
            base_branch: None,
        }
    }
}

impl ExecuteOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_agents: config.orchestrator.max_agents,
            agent_timeout: Duration::from_secs(config.orchestrator.agent_timeout_minutes * 60),
            use_process_isolation: config.orchestrator.use_process_isolation,
            auto_merge_results: config.orchestrator.auto_merge_results,
            retry_failed: config.orchestrator.retry_failed,
            skip_failed: config.orchestrator.skip_failed,
            max_retries: config.orchestrator.max_retries,
            ..Default::default()
        }
    }
}

/// Final record for one subtask
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: SubTaskStatus,
    pub agent_id: Option<String>,
    pub iterations: u32,
    pub warning: Option<String>,
    pub error: Option<String>,
}

/// Result of one plan execution
#[derive(Debug)]
pub struct OrchestratorResult {
    pub plan_id: String,

    /// True when every subtask completed
    pub success: bool,

    /// Set only when a merge was attempted
    pub merge_success: Option<bool>,

    pub duration: Duration,
    pub outcomes: Vec<TaskOutcome>,
    pub error: Option<String>,

    /// The plan with final statuses
    pub plan: TaskPlan,
}

/// Executes TaskPlans over a pool of agents
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    store: MemoryStore,
    loop_config: AgentLoopConfig,
    work_dir: PathBuf,
    indexer: Option<Arc<SymbolIndexer>>,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
    cancel: CancelToken,
    process_registry: Arc<ProcessRegistry>,

    /// Executable spawned for process-isolated agents
    agent_program: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, store: MemoryStore, work_dir: PathBuf, loop_config: AgentLoopConfig) -> Self {
        Self {
            llm,
            store,
            loop_config,
            work_dir,
            indexer: None,
            events: None,
            cancel: CancelToken::noop(),
            process_registry: Arc::new(ProcessRegistry::new()),
            agent_program: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<SymbolIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_agent_program(mut self, program: PathBuf) -> Self {
        self.agent_program = Some(program);
        self
    }

    async fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn persist(&self, plan: &TaskPlan, options: &ExecuteOptions) -> Result<()> {
        if let Some(path) = &options.plan_path {
            save_plan_with_retry(plan, path)
                .await
                .context("Plan persistence failed unrecoverably")?;
        }
        Ok(())
    }

    /// Execute a plan to completion under the configured policies
    ///
    /// Only infrastructure failures (unrecoverable persistence, git setup)
    /// surface as `Err`; scheduling blockages are reported in the result.
    pub async fn execute_plan(&self, mut plan: TaskPlan, options: &ExecuteOptions) -> Result<OrchestratorResult> {
        let started = Instant::now();
        plan.validate().context("Plan failed validation")?;

        // Re-running a finished plan is a no-op: no branches, no tasks
        if plan.is_complete() {
            info!(plan_id = %plan.id, "Plan already complete; nothing to do");
            let outcomes = collect_outcomes(&plan, &HashMap::new());
            return Ok(OrchestratorResult {
                plan_id: plan.id.clone(),
                success: true,
                merge_success: None,
                duration: started.elapsed(),
                outcomes,
                error: None,
                plan,
            });
        }

        // Crash recovery: InProgress subtasks are known not-owned at startup
        let recovered = plan.recover_in_progress();
        if recovered > 0 {
            warn!(recovered, plan_id = %plan.id, "Reset orphaned in-progress subtasks to pending");
            self.persist(&plan, options).await?;
        }

        gitops::ensure_repo(&self.work_dir)
            .await
            .context("Failed to prepare git repository")?;
        let orchestration_branch = format!("orchestration/{}", plan.id);
        if gitops::branch_exists(&self.work_dir, &orchestration_branch).await {
            gitops::checkout(&self.work_dir, &orchestration_branch)
                .await
                .context("Failed to check out orchestration branch")?;
        } else {
            gitops::create_branch(&self.work_dir, &orchestration_branch, options.base_branch.as_deref())
                .await
                .context("Failed to create orchestration branch")?;
        }

        let pool = AgentPool::new(options.max_agents, self.work_dir.join("agents"));
        let mut runs: HashMap<String, (Option<String>, AgentTaskResult)> = HashMap::new();
        let mut error: Option<String> = None;
        let mut phase: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                error = Some("cancelled".to_string());
                break;
            }

            let group = plan.runnable_group(options.skip_failed, options.retry_failed, options.max_retries);
            if group.is_empty() {
                // Transitive blocking emerges here once nothing is runnable
                if !options.skip_failed {
                    loop {
                        let blocked = plan.directly_blocked();
                        if blocked.is_empty() {
                            break;
                        }
                        for id in blocked {
                            plan.set_status(&id, SubTaskStatus::Blocked);
                        }
                    }
                    self.persist(&plan, options).await?;
                }

                // Failed leftovers without dependents are not a blockage;
                // the success flag reports them
                let counts = plan.status_counts();
                if counts.pending + counts.in_progress + counts.blocked > 0 {
                    error = Some(describe_blockage(&plan));
                }
                break;
            }

            phase += 1;
            info!(plan_id = %plan.id, phase, group = ?group, "Starting phase");

            // Mark the group in progress before any agent starts
            for id in &group {
                let task = plan.get_mut(id).expect("group ids come from the plan");
                if task.status == SubTaskStatus::Failed {
                    task.retry_count += 1;
                }
                task.status = SubTaskStatus::InProgress;
            }
            self.persist(&plan, options).await?;

            let prior = prior_summaries(&plan, &runs);
            let plan_id = plan.id.clone();
            let mut in_flight: FuturesUnordered<_> = group
                .iter()
                .map(|id| {
                    let mut task = plan.get(id).expect("group ids come from the plan").clone();
                    if options.require_tests_pass {
                        task.description.push_str(
                            "\n\nBefore declaring completion, run the project's test suite with \
                             the run_command tool and make sure it passes.",
                        );
                    }
                    let command = AgentCommand {
                        subtask: task,
                        original_request: plan.original_request.clone(),
                        prior_results: prior.clone(),
                    };
                    self.run_one_task(command, plan_id.clone(), &pool, options)
                })
                .collect();

            let mut completed = 0usize;
            let mut failed = 0usize;
            while let Some((task_id, agent_id, result)) = in_flight.next().await {
                let new_status = if result.cancelled {
                    // Cancelled work is resumable, not failed
                    SubTaskStatus::Pending
                } else if result.success {
                    completed += 1;
                    SubTaskStatus::Completed
                } else {
                    failed += 1;
                    SubTaskStatus::Failed
                };

                {
                    let task = plan.get_mut(&task_id).expect("task ids are stable");
                    task.assigned_agent_id = agent_id.clone();
                    task.last_error = match new_status {
                        SubTaskStatus::Completed => None,
                        SubTaskStatus::Failed => result.error.clone().or_else(|| result.bailout_reason.clone()),
                        _ => task.last_error.clone(),
                    };
                }
                plan.set_status(&task_id, new_status);

                // Final status persists as each subtask completes
                self.persist(&plan, options).await?;
                self.emit(OrchestratorEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    success: result.success,
                })
                .await;

                runs.insert(task_id, (agent_id, result));
            }
            drop(in_flight);

            // Direct dependents of failures block at the phase barrier
            if !options.skip_failed {
                for id in plan.directly_blocked() {
                    plan.set_status(&id, SubTaskStatus::Blocked);
                }
            }
            self.persist(&plan, options).await?;
            self.emit(OrchestratorEvent::PhaseCompleted {
                phase,
                completed,
                failed,
            })
            .await;
        }

        // Merge each agent branch back with one merge commit per branch
        let mut merge_success = None;
        if options.auto_merge_results && plan.is_complete() && error.is_none() {
            merge_success = Some(self.merge_agent_branches(&plan, &orchestration_branch).await);
        }

        let success = plan.is_complete() && error.is_none();
        self.emit(OrchestratorEvent::PlanCompleted {
            plan_id: plan.id.clone(),
            success,
        })
        .await;
        self.persist(&plan, options).await?;

        info!(
            plan_id = %plan.id,
            success,
            ?merge_success,
            duration_ms = started.elapsed().as_millis() as u64,
            "Plan execution finished"
        );

        let outcomes = collect_outcomes(&plan, &runs);
        Ok(OrchestratorResult {
            plan_id: plan.id.clone(),
            success,
            merge_success,
            duration: started.elapsed(),
            outcomes,
            error,
            plan,
        })
    }

    /// Run one subtask on a pool agent inside its own worktree
    async fn run_one_task(
        &self,
        command: AgentCommand,
        plan_id: String,
        pool: &AgentPool,
        options: &ExecuteOptions,
    ) -> (String, Option<String>, AgentTaskResult) {
        let task_id = command.subtask.id.clone();

        let Some(agent) = pool.acquire_wait(&task_id, &self.cancel).await else {
            return (task_id.clone(), None, cancelled_result(&task_id, ""));
        };
        let agent_id = agent.agent_id.clone();
        self.emit(OrchestratorEvent::AgentStarted {
            agent_id: agent_id.clone(),
            task_id: task_id.clone(),
        })
        .await;

        let branch = agent_branch(&plan_id, &agent_id, &task_id);
        pool.set_branch(&agent_id, &branch);
        let worktree = self.work_dir.join("agents").join(&agent_id).join(&task_id);
        let orchestration_branch = format!("orchestration/{plan_id}");

        if let Err(e) = gitops::add_worktree(&self.work_dir, &worktree, &branch, &orchestration_branch).await {
            pool.release(&agent_id, false);
            return (
                task_id.clone(),
                Some(agent_id.clone()),
                failed_result(&task_id, &agent_id, "worktree_setup", e.to_string()),
            );
        }

        let result = if options.use_process_isolation && self.agent_program.is_some() {
            self.run_isolated(&command, &agent_id, &worktree, options).await
        } else {
            self.run_in_process(&command, &agent_id, &worktree, options).await
        };

        // Commit whatever the agent produced; the branch carries it home
        if let Err(e) = gitops::commit_all(&worktree, &format!("{} ({agent_id})", command.subtask.title)).await {
            warn!(task_id = %task_id, error = %e, "Agent work commit failed");
        }
        if let Err(e) = gitops::remove_worktree(&self.work_dir, &worktree).await {
            warn!(task_id = %task_id, error = %e, "Worktree removal failed");
        }

        pool.release(&agent_id, result.success);
        (task_id, Some(agent_id), result)
    }

    async fn run_in_process(
        &self,
        command: &AgentCommand,
        agent_id: &str,
        worktree: &std::path::Path,
        options: &ExecuteOptions,
    ) -> AgentTaskResult {
        let tools = ToolExecutor::with_process_registry(self.process_registry.clone());
        let engine = AgentLoop::new(self.llm.clone(), self.store.clone(), tools, self.loop_config.clone());

        let mut ctx = ToolContext::new(worktree.to_path_buf(), agent_id.to_string()).with_cancel(self.cancel.clone());
        if let Some(indexer) = &self.indexer {
            ctx = ctx.with_indexer(indexer.clone());
        }

        // Bridge agent events into orchestrator events
        let (agent_tx, forwarder) = match self.events.clone() {
            Some(out) => {
                let (tx, mut rx) = mpsc::channel::<AgentEvent>(128);
                let handle = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let mapped = match event {
                            AgentEvent::Token { agent_id, text } => OrchestratorEvent::AgentOutput { agent_id, text },
                            AgentEvent::ToolStarted { agent_id, tool, .. } => {
                                OrchestratorEvent::AgentToolCall { agent_id, tool }
                            }
                            AgentEvent::ToolCompleted {
                                agent_id,
                                tool,
                                status,
                                elapsed_ms,
                                ..
                            } => OrchestratorEvent::AgentToolProgress {
                                agent_id,
                                tool,
                                status,
                                elapsed_ms,
                            },
                            AgentEvent::Usage { .. } => continue,
                        };
                        let _ = out.send(mapped).await;
                    }
                });
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let run = engine.run(
            &command.subtask,
            &command.original_request,
            &command.prior_results,
            &ctx,
            agent_tx,
        );

        let result = match tokio::time::timeout(options.agent_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %command.subtask.id, "Agent timed out");
                failed_result(
                    &command.subtask.id,
                    agent_id,
                    "agent_timeout",
                    format!("agent exceeded {:?}", options.agent_timeout),
                )
            }
        };

        if let Some(handle) = forwarder {
            handle.abort();
        }
        result
    }

    async fn run_isolated(
        &self,
        command: &AgentCommand,
        agent_id: &str,
        worktree: &std::path::Path,
        options: &ExecuteOptions,
    ) -> AgentTaskResult {
        let program = self.agent_program.as_ref().expect("checked by caller");

        let mut process = match AgentProcess::spawn(program, agent_id, worktree, AGENT_STARTUP_TIMEOUT).await {
            Ok(p) => p,
            Err(e) => {
                return failed_result(&command.subtask.id, agent_id, "agent_start_failed", e.to_string());
            }
        };

        let result = match process.run_task(command, options.agent_timeout).await {
            Ok(result) => result,
            Err(e) => failed_result(&command.subtask.id, agent_id, "agent_process", e.to_string()),
        };

        process.shutdown().await;
        result
    }

    /// Merge every completed agent branch into the orchestration branch
    async fn merge_agent_branches(&self, plan: &TaskPlan, orchestration_branch: &str) -> bool {
        if let Err(e) = gitops::checkout(&self.work_dir, orchestration_branch).await {
            warn!(error = %e, "Failed to check out orchestration branch for merging");
            return false;
        }

        let mut all_merged = true;
        for task in &plan.subtasks {
            let Some(agent_id) = &task.assigned_agent_id else {
                continue;
            };
            let branch = agent_branch(&plan.id, agent_id, &task.id);
            if !gitops::branch_exists(&self.work_dir, &branch).await {
                continue;
            }

            let message = format!("Merge subtask {}: {}", task.id, task.title);
            match gitops::merge_branch(&self.work_dir, &branch, &message).await {
                Ok(outcome) if outcome.is_merged() => {}
                Ok(_) => {
                    warn!(branch = %branch, "Merge conflict on agent branch");
                    all_merged = false;
                }
                Err(e) => {
                    warn!(branch = %branch, error = %e, "Merge failed");
                    all_merged = false;
                }
            }
        }
        all_merged
    }
}

fn agent_branch(plan_id: &str, agent_id: &str, task_id: &str) -> String {
    format!("agent/{plan_id}/{agent_id}/{task_id}")
}

fn failed_result(task_id: &str, agent_id: &str, bailout: &str, error: String) -> AgentTaskResult {
    AgentTaskResult {
        task_id: task_id.to_string(),
        agent_id: agent_id.to_string(),
        session_id: None,
        success: false,
        warning: None,
        bailout_reason: Some(bailout.to_string()),
        error: Some(error),
        final_text: String::new(),
        iterations: 0,
        context_tokens: 0,
        completion_tokens: 0,
        cancelled: false,
    }
}

fn cancelled_result(task_id: &str, agent_id: &str) -> AgentTaskResult {
    AgentTaskResult {
        cancelled: true,
        bailout_reason: Some("cancelled".to_string()),
        ..failed_result(task_id, agent_id, "cancelled", "cancelled".to_string())
    }
}

/// Summaries of finished subtasks, for dependent agents' context
fn prior_summaries(plan: &TaskPlan, runs: &HashMap<String, (Option<String>, AgentTaskResult)>) -> Vec<PriorTaskSummary> {
    plan.subtasks
        .iter()
        .filter(|t| matches!(t.status, SubTaskStatus::Completed | SubTaskStatus::Failed))
        .map(|t| {
            let summary = runs
                .get(&t.id)
                .map(|(_, r)| {
                    if r.final_text.is_empty() {
                        r.error.clone().unwrap_or_default()
                    } else {
                        r.final_text.clone()
                    }
                })
                .unwrap_or_default();
            PriorTaskSummary {
                task_id: t.id.clone(),
                title: t.title.clone(),
                success: t.status == SubTaskStatus::Completed,
                summary,
            }
        })
        .collect()
}

fn collect_outcomes(plan: &TaskPlan, runs: &HashMap<String, (Option<String>, AgentTaskResult)>) -> Vec<TaskOutcome> {
    plan.subtasks
        .iter()
        .map(|task| {
            let run = runs.get(&task.id);
            TaskOutcome {
                task_id: task.id.clone(),
                status: task.status,
                agent_id: task.assigned_agent_id.clone(),
                iterations: run.map(|(_, r)| r.iterations).unwrap_or(0),
                warning: run.and_then(|(_, r)| r.warning.clone()),
                error: task.last_error.clone(),
            }
        })
        .collect()
}

/// Explain why no subtask is runnable
fn describe_blockage(plan: &TaskPlan) -> String {
    let counts = plan.status_counts();
    let failed: Vec<&str> = plan
        .subtasks
        .iter()
        .filter(|t| t.status == SubTaskStatus::Failed)
        .map(|t| t.id.as_str())
        .collect();

    if !failed.is_empty() || counts.blocked > 0 {
        format!(
            "cannot make progress: {} failed ({}), {} blocked on failed dependencies. \
             Enable skip_failed to run dependents anyway, or retry_failed to retry failures.",
            failed.len(),
            failed.join(", "),
            counts.blocked
        )
    } else if counts.in_progress > 0 {
        format!("{} subtasks still marked in progress but not owned by any agent", counts.in_progress)
    } else {
        format!("{} pending subtasks have unsatisfiable dependencies", counts.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SubTask;
    use crate::llm::LlmError;
    use crate::llm::client::mock::MockLlmClient;
    use tempfile::tempdir;

    fn orchestrator_with(temp: &tempfile::TempDir, llm: MockLlmClient) -> Orchestrator {
        let store = MemoryStore::open(temp.path().join("state").join("swarmd.db")).unwrap();
        let work_dir = temp.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        Orchestrator::new(Arc::new(llm), store, work_dir, AgentLoopConfig::default())
    }

    fn chain_plan() -> TaskPlan {
        let a = SubTask::with_id("a", "Task A", "first");
        let b = SubTask::with_id("b", "Task B", "second, relies on A's output").depends_on("a");
        let c = SubTask::with_id("c", "Task C", "third, relies on B's output").depends_on("b");
        TaskPlan::new("build the thing", "chain", vec![a, b, c]).unwrap()
    }

    fn api_error() -> LlmError {
        LlmError::ApiError {
            status: 400,
            message: "bad request".to_string(),
        }
    }

    #[tokio::test]
    async fn test_execute_independent_tasks() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![
            MockLlmClient::text_response("TASK COMPLETE"),
            MockLlmClient::text_response("TASK COMPLETE"),
        ]);
        let orch = orchestrator_with(&temp, llm);

        let plan = TaskPlan::new(
            "two independent tasks",
            "pair",
            vec![
                SubTask::with_id("t1", "First", "do one thing"),
                SubTask::with_id("t2", "Second", "do another"),
            ],
        )
        .unwrap();

        let result = orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.merge_success, Some(true));
        assert!(result.plan.is_complete());
        assert!(result.outcomes.iter().all(|o| o.status == SubTaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_chain() {
        let temp = tempdir().unwrap();
        // Task A's only LLM call fails outright
        let llm = MockLlmClient::scripted(vec![Err(api_error())]);
        let orch = orchestrator_with(&temp, llm);

        let result = orch.execute_plan(chain_plan(), &ExecuteOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.plan.get("a").unwrap().status, SubTaskStatus::Failed);
        assert_eq!(result.plan.get("b").unwrap().status, SubTaskStatus::Blocked);
        assert_eq!(result.plan.get("c").unwrap().status, SubTaskStatus::Blocked);

        let error = result.error.unwrap();
        assert!(error.contains("skip"), "error should mention skip: {error}");
    }

    #[tokio::test]
    async fn test_skip_failed_runs_dependents() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::scripted(vec![
            Err(api_error()),
            Ok(MockLlmClient::text_response("TASK COMPLETE")),
            Ok(MockLlmClient::text_response("TASK COMPLETE")),
        ]);
        let orch = orchestrator_with(&temp, llm);

        let options = ExecuteOptions {
            skip_failed: true,
            ..Default::default()
        };
        let result = orch.execute_plan(chain_plan(), &options).await.unwrap();

        // The orchestrator itself reports no blockage
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(result.plan.get("a").unwrap().status, SubTaskStatus::Failed);
        assert_eq!(result.plan.get("b").unwrap().status, SubTaskStatus::Completed);
        assert_eq!(result.plan.get("c").unwrap().status, SubTaskStatus::Completed);
        // The plan as a whole still failed one subtask
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_retry_failed_reruns_with_incremented_count() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::scripted(vec![
            Err(api_error()),
            Ok(MockLlmClient::text_response("TASK COMPLETE")),
        ]);
        let orch = orchestrator_with(&temp, llm);

        let plan = TaskPlan::new("one flaky task", "flaky", vec![SubTask::with_id("t1", "Flaky", "try hard")]).unwrap();
        let options = ExecuteOptions {
            retry_failed: true,
            max_retries: 1,
            ..Default::default()
        };

        let result = orch.execute_plan(plan, &options).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        let task = result.plan.get("t1").unwrap();
        assert_eq!(task.status, SubTaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_rerun_complete_plan_is_noop() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![]);
        let orch = orchestrator_with(&temp, llm);

        let mut plan = chain_plan();
        for id in ["a", "b", "c"] {
            plan.set_status(id, SubTaskStatus::Completed);
        }

        let result = orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();

        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.merge_success, None);
        // No git repository was created: no branches, no tasks re-executed
        assert!(!orch.work_dir.join(".git").exists());
    }

    #[tokio::test]
    async fn test_crash_recovery_resets_in_progress() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("TASK COMPLETE")]);
        let orch = orchestrator_with(&temp, llm);

        let mut plan =
            TaskPlan::new("one task", "single", vec![SubTask::with_id("t1", "Only", "do it")]).unwrap();
        // Simulate a crash that left the subtask in progress
        plan.get_mut("t1").unwrap().status = SubTaskStatus::InProgress;
        plan.get_mut("t1").unwrap().assigned_agent_id = Some("agent-zombie".to_string());

        let result = orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.plan.get("t1").unwrap().status, SubTaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_plan_file_persisted_through_execution() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("TASK COMPLETE")]);
        let orch = orchestrator_with(&temp, llm);

        let plan_path = temp.path().join("plan.json");
        let plan = TaskPlan::new("one task", "single", vec![SubTask::with_id("t1", "Only", "do it")]).unwrap();
        let options = ExecuteOptions {
            plan_path: Some(plan_path.clone()),
            ..Default::default()
        };

        orch.execute_plan(plan, &options).await.unwrap();

        let persisted = crate::domain::load_plan(&plan_path).unwrap();
        assert_eq!(persisted.get("t1").unwrap().status, SubTaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![MockLlmClient::text_response("TASK COMPLETE")]);
        let (tx, mut rx) = mpsc::channel(128);
        let orch = orchestrator_with(&temp, llm).with_events(tx);

        let plan = TaskPlan::new("one task", "single", vec![SubTask::with_id("t1", "Only", "do it")]).unwrap();
        orch.execute_plan(plan, &ExecuteOptions::default()).await.unwrap();

        let mut saw_started = false;
        let mut saw_task_completed = false;
        let mut saw_phase = false;
        let mut saw_plan = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                OrchestratorEvent::AgentStarted { .. } => saw_started = true,
                OrchestratorEvent::TaskCompleted { success, .. } => {
                    assert!(success);
                    saw_task_completed = true;
                }
                OrchestratorEvent::PhaseCompleted { completed, .. } => {
                    assert_eq!(completed, 1);
                    saw_phase = true;
                }
                OrchestratorEvent::PlanCompleted { success, .. } => {
                    assert!(success);
                    saw_plan = true;
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_task_completed && saw_phase && saw_plan);
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        let temp = tempdir().unwrap();
        let llm = MockLlmClient::new(vec![]);
        let (handle, token) = crate::cancel::cancel_pair();
        handle.cancel();
        let orch = orchestrator_with(&temp, llm).with_cancel(token);

        let result = orch.execute_plan(chain_plan(), &ExecuteOptions::default()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        // Nothing ran
        assert!(result.plan.subtasks.iter().all(|t| t.status == SubTaskStatus::Pending));
    }

    #[test]
    fn test_agent_branch_convention() {
        assert_eq!(
            agent_branch("plan-1", "agent-001", "t1"),
            "agent/plan-1/agent-001/t1"
        );
    }
}
