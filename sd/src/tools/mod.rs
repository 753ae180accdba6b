//! Atomic tool substrate
//!
//! The tools the agent loop's correctness depends on: atomic file write,
//! chunked write, unified-diff patch apply, whitelisted process execution,
//! and background process sessions, plus the read/list helpers every coding
//! agent needs.

pub mod builtin;
mod context;
mod error;
mod executor;
mod traits;

pub use builtin::ProcessRegistry;
pub use context::ToolContext;
pub use error::ToolError;
pub use executor::{ToolCallStatus, ToolExecutor, ToolOutcome};
pub use traits::{Tool, ToolResult};
