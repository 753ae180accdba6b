//! ToolContext - execution context for tools
//!
//! Each agent gets its own `ToolContext` that scopes every file operation to
//! its work directory. Relative paths resolve against it; anything resolving
//! outside is rejected before the filesystem is touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::index::SymbolIndexer;

use super::ToolError;

/// Execution context for tools - scoped to a single agent
#[derive(Clone)]
pub struct ToolContext {
    /// Agent work directory - all file ops constrained here
    pub work_dir: PathBuf,

    /// Owning agent id
    pub agent_id: String,

    /// Cooperative cancellation, checked at every tool boundary
    pub cancel: CancelToken,

    /// Indexer for fire-and-forget reindexing after writes
    indexer: Option<Arc<SymbolIndexer>>,
}

impl ToolContext {
    pub fn new(work_dir: PathBuf, agent_id: String) -> Self {
        Self {
            work_dir,
            agent_id,
            cancel: CancelToken::noop(),
            indexer: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<SymbolIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Resolve a path against the work directory
    fn normalize_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    /// Validate a path stays inside the work directory
    ///
    /// Existing paths are canonicalized to defeat symlink escapes; paths that
    /// do not exist yet are checked through their nearest existing parent.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, ToolError> {
        let normalized = self.normalize_path(path);

        let canonical = if normalized.exists() {
            normalized.canonicalize().unwrap_or_else(|_| normalized.clone())
        } else if let Some(parent) = normalized.parent() {
            if parent.exists() {
                let canonical_parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
                canonical_parent.join(normalized.file_name().unwrap_or_default())
            } else {
                normalized.clone()
            }
        } else {
            normalized.clone()
        };

        let work_canonical = self.work_dir.canonicalize().unwrap_or_else(|_| self.work_dir.clone());

        if canonical.starts_with(&work_canonical) {
            Ok(canonical)
        } else {
            Err(ToolError::PathEscape {
                path: path.to_path_buf(),
                work_dir: self.work_dir.clone(),
            })
        }
    }

    /// Fire-and-forget reindex of an indexable file
    pub fn schedule_reindex(&self, path: &Path) {
        if let Some(indexer) = &self.indexer
            && indexer.is_indexable(path)
        {
            indexer.clone().spawn_reindex(path.to_path_buf());
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("work_dir", &self.work_dir)
            .field("agent_id", &self.agent_id)
            .finish()
    }
}
