//! Tool-internal error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by tool helpers before an envelope is built
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Path {path} escapes the work directory {work_dir}")]
    PathEscape { path: PathBuf, work_dir: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
