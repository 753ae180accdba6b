//! TaskPlan and SubTask types
//!
//! A plan is a DAG of subtasks for one user request. The orchestrator is the
//! only mutator once a plan exists; the planner only creates. Status counts
//! always sum to the subtask count.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::id::generate_id;

/// Kind of work a subtask performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Code,
    Build,
    Test,
    Docs,
    Other,
}

/// Estimated difficulty, drives the iteration cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    /// Iteration cap for the agent loop
    pub fn max_iterations(&self) -> u32 {
        match self {
            Complexity::Trivial => 20,
            Complexity::Simple => 35,
            Complexity::Moderate => 50,
            Complexity::Complex => 75,
            Complexity::VeryComplex => 100,
        }
    }
}

/// Subtask lifecycle status
///
/// `Pending -> InProgress -> {Completed | Failed}`; `Pending -> Blocked` when
/// a dependency failed and skipping is off. `Failed -> InProgress` only via
/// explicit retry; `InProgress -> Pending` only on crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::InProgress => "in_progress",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
            SubTaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed | SubTaskStatus::Blocked)
    }
}

/// One unit of work within a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub title: String,
    pub description: String,

    #[serde(default)]
    pub task_type: TaskType,

    #[serde(default)]
    pub complexity: Complexity,

    #[serde(default)]
    pub estimated_minutes: u32,

    /// Tool names this subtask needs exposed to its agent
    #[serde(default)]
    pub required_tools: Vec<String>,

    /// Glob patterns of files this subtask is expected to touch
    #[serde(default)]
    pub files_affected: Vec<String>,

    /// Ids of subtasks that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub status: SubTaskStatus,

    #[serde(default)]
    pub assigned_agent_id: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub use_thinking_model: bool,
}

impl SubTask {
    /// Create a subtask with a generated id
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        Self::with_id(generate_id("task", &title), title, description)
    }

    /// Create a subtask with an explicit id
    pub fn with_id(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            task_type: TaskType::default(),
            complexity: Complexity::default(),
            estimated_minutes: 0,
            required_tools: Vec::new(),
            files_affected: Vec::new(),
            dependencies: Vec::new(),
            status: SubTaskStatus::default(),
            assigned_agent_id: None,
            retry_count: 0,
            last_error: None,
            use_thinking_model: false,
        }
    }

    /// Add a dependency edge
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }
}

/// Plan validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("Duplicate subtask id: {0}")]
    DuplicateId(String),

    #[error("Subtask {task} depends on unknown id: {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle involving: {0}")]
    Cycle(String),

    #[error("Plan has no subtasks")]
    Empty,
}

/// Per-status counts; sums to the subtask count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.blocked
    }
}

/// A DAG of subtasks for one user request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,

    /// The user's original natural-language request
    pub original_request: String,

    pub summary: String,

    /// Ordered list; groups are recomputed from statuses, not stored
    pub subtasks: Vec<SubTask>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskPlan {
    /// Create and validate a plan
    pub fn new(
        original_request: impl Into<String>,
        summary: impl Into<String>,
        subtasks: Vec<SubTask>,
    ) -> Result<Self, PlanValidationError> {
        let summary = summary.into();
        let now = Utc::now();
        let plan = Self {
            id: generate_id("plan", &summary),
            original_request: original_request.into(),
            summary,
            subtasks,
            created_at: now,
            updated_at: now,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check id uniqueness, dependency resolution, and acyclicity
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.subtasks.is_empty() {
            return Err(PlanValidationError::Empty);
        }

        let mut ids = HashSet::new();
        for task in &self.subtasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanValidationError::DuplicateId(task.id.clone()));
            }
        }

        for task in &self.subtasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanValidationError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm: anything left over sits on a cycle
        let mut in_degree: HashMap<&str, usize> =
            self.subtasks.iter().map(|t| (t.id.as_str(), t.dependencies.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.subtasks {
            for dep in &task.dependencies {
                dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                let d = in_degree.get_mut(dependent).expect("dependent is a known id");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != self.subtasks.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .min()
                .unwrap_or("unknown");
            return Err(PlanValidationError::Cycle(stuck.to_string()));
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SubTask> {
        self.subtasks.iter_mut().find(|t| t.id == id)
    }

    /// Transition a subtask's status and touch the plan timestamp
    pub fn set_status(&mut self, id: &str, status: SubTaskStatus) {
        if let Some(task) = self.get_mut(id) {
            task.status = status;
            if status == SubTaskStatus::Pending {
                task.assigned_agent_id = None;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Per-status counts
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.subtasks {
            match task.status {
                SubTaskStatus::Pending => counts.pending += 1,
                SubTaskStatus::InProgress => counts.in_progress += 1,
                SubTaskStatus::Completed => counts.completed += 1,
                SubTaskStatus::Failed => counts.failed += 1,
                SubTaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    pub fn is_complete(&self) -> bool {
        self.subtasks.iter().all(|t| t.status == SubTaskStatus::Completed)
    }

    /// Whether a dependency counts as satisfied under the given policy
    fn dependency_satisfied(&self, dep_id: &str, skip_failed: bool) -> bool {
        match self.get(dep_id).map(|d| d.status) {
            Some(SubTaskStatus::Completed) => true,
            Some(SubTaskStatus::Failed) | Some(SubTaskStatus::Blocked) => skip_failed,
            _ => false,
        }
    }

    /// The next runnable group, sorted by subtask id for stable start order
    ///
    /// A subtask is runnable when Pending with every dependency satisfied, or
    /// (with `retry_failed`) Failed with retries remaining.
    pub fn runnable_group(&self, skip_failed: bool, retry_failed: bool, max_retries: u32) -> Vec<String> {
        let mut group: Vec<String> = self
            .subtasks
            .iter()
            .filter(|t| match t.status {
                SubTaskStatus::Pending => t
                    .dependencies
                    .iter()
                    .all(|dep| self.dependency_satisfied(dep, skip_failed)),
                SubTaskStatus::Failed => retry_failed && t.retry_count < max_retries,
                _ => false,
            })
            .map(|t| t.id.clone())
            .collect();
        group.sort();
        group
    }

    /// Ids of Pending subtasks directly depending on any Failed subtask
    pub fn directly_blocked(&self) -> Vec<String> {
        let failed: HashSet<&str> = self
            .subtasks
            .iter()
            .filter(|t| t.status == SubTaskStatus::Failed || t.status == SubTaskStatus::Blocked)
            .map(|t| t.id.as_str())
            .collect();

        self.subtasks
            .iter()
            .filter(|t| {
                t.status == SubTaskStatus::Pending && t.dependencies.iter().any(|d| failed.contains(d.as_str()))
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Reset orphaned InProgress subtasks to Pending (crash recovery)
    pub fn recover_in_progress(&mut self) -> usize {
        let mut recovered = 0;
        for task in &mut self.subtasks {
            if task.status == SubTaskStatus::InProgress {
                task.status = SubTaskStatus::Pending;
                task.assigned_agent_id = None;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.updated_at = Utc::now();
        }
        recovered
    }
}
