//! AgentPool - bounded pool of agent instances
//!
//! `acquire -> running -> release` is the only normal cycle. An idle agent is
//! reused before a new one is created; the pool never exceeds `max_agents`.
//! Callers that get `None` wait and retry at a fixed short interval.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cancel::CancelToken;

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Stopping,
    Stopped,
}

/// Runtime record of one agent
#[derive(Debug, Clone)]
pub struct AgentInstance {
    pub agent_id: String,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    /// Exclusive subdirectory under the orchestration work root
    pub work_directory: PathBuf,

    pub assigned_branch: Option<String>,
    pub completed_count: u32,
    pub failed_count: u32,
}

struct PoolInner {
    agents: HashMap<String, AgentInstance>,
    next_index: u32,
}

/// Bounded pool of agent instances
pub struct AgentPool {
    inner: Mutex<PoolInner>,
    max_agents: usize,
    work_root: PathBuf,
}

impl AgentPool {
    /// Create a pool rooted at `work_root` (the `agents/` directory)
    pub fn new(max_agents: usize, work_root: PathBuf) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                agents: HashMap::new(),
                next_index: 0,
            }),
            max_agents: max_agents.max(1),
            work_root,
        }
    }

    /// Acquire an agent for a task
    ///
    /// Returns an idle agent if one exists, creates a new one while under
    /// the cap, otherwise `None` (the caller waits).
    pub fn acquire(&self, task_id: &str) -> Option<AgentInstance> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        if let Some(agent) = inner
            .agents
            .values_mut()
            .find(|a| a.state == AgentState::Idle)
        {
            agent.state = AgentState::Running;
            agent.current_task_id = Some(task_id.to_string());
            agent.last_activity_at = now;
            debug!(agent_id = %agent.agent_id, task_id, "Reusing idle agent");
            return Some(agent.clone());
        }

        if inner.agents.len() < self.max_agents {
            inner.next_index += 1;
            let agent_id = format!("agent-{:03}", inner.next_index);
            let agent = AgentInstance {
                agent_id: agent_id.clone(),
                state: AgentState::Running,
                current_task_id: Some(task_id.to_string()),
                started_at: now,
                last_activity_at: now,
                work_directory: self.work_root.join(&agent_id),
                assigned_branch: None,
                completed_count: 0,
                failed_count: 0,
            };
            inner.agents.insert(agent_id.clone(), agent.clone());
            info!(agent_id = %agent_id, task_id, "Agent created");
            return Some(agent);
        }

        None
    }

    /// Wait for an agent, retrying at a fixed interval; `None` on cancellation
    pub async fn acquire_wait(&self, task_id: &str, cancel: &CancelToken) -> Option<AgentInstance> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(agent) = self.acquire(task_id) {
                return Some(agent);
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }
    }

    /// Return an agent to the pool
    pub fn release(&self, agent_id: &str, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            if success {
                agent.completed_count += 1;
            } else {
                agent.failed_count += 1;
            }
            agent.state = AgentState::Idle;
            agent.current_task_id = None;
            agent.assigned_branch = None;
            agent.last_activity_at = Utc::now();
            debug!(agent_id, success, "Agent released");
        }
    }

    /// Record the branch an agent is working on
    pub fn set_branch(&self, agent_id: &str, branch: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            agent.assigned_branch = Some(branch.to_string());
        }
    }

    /// Mark an agent stopped
    pub fn stop(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            agent.state = AgentState::Stopped;
            agent.current_task_id = None;
        }
    }

    /// Mark every agent stopped
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for agent in inner.agents.values_mut() {
            agent.state = AgentState::Stopped;
            agent.current_task_id = None;
        }
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().unwrap().agents.len()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentInstance> {
        self.inner.lock().unwrap().agents.get(agent_id).cloned()
    }

    /// Snapshot of all agents
    pub fn agents(&self) -> Vec<AgentInstance> {
        self.inner.lock().unwrap().agents.values().cloned().collect()
    }
}
