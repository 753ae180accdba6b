//! Domain types: plans, subtasks, ids, and the plan-file contract

mod id;
mod plan;
mod planfile;

pub use id::generate_id;
pub use plan::{Complexity, PlanValidationError, SubTask, SubTaskStatus, TaskPlan, TaskType};
pub use planfile::{load_plan, save_plan, save_plan_with_retry};
