//! memstore - durable session, message, and code-symbol store
//!
//! Single-host SQLite store used by the swarmd agent loop. Holds persisted
//! LLM sessions and their messages (with an FTS5 index over message text),
//! the code-symbol index with file change detection, and key/value context
//! memory. Connections are short-lived and per-operation; multi-row writes
//! run inside explicit transactions.
//!
//! # Modules
//!
//! - [`db`] - connection handling, pragmas, additive schema migrations
//! - [`sessions`] - session CRUD and activity tracking
//! - [`messages`] - message lifecycle, summarization, active replay
//! - [`search`] - full-text search with FTS-safe query construction
//! - [`symbols`] - code-symbol index and batch indexing
//! - [`context`] - key/value context memory with expiry

pub mod cli;
pub mod context;
pub mod db;
pub mod error;
pub mod messages;
pub mod search;
pub mod sessions;
pub mod symbols;
pub mod types;

pub use context::ContextEntry;
pub use db::Db;
pub use error::StoreError;
pub use messages::{MessageCompletion, NewMessage};
pub use search::{SearchHit, SearchOptions, build_match_query};
pub use sessions::NewSession;
pub use symbols::{FileMetadata, NewSymbol, NewSymbolRef, SymbolRef};
pub use types::{CodeSymbol, ContextKind, Message, MessageStatus, MessageType, Session};

use std::path::{Path, PathBuf};

/// Result alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the durable store
///
/// Cheap to clone - holds only the database path. Every operation opens its
/// own short-lived connection with WAL and a 5 s busy timeout.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    db: Db,
}

impl MemoryStore {
    /// Open (or create) the store at `path` and run migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Db::open(path)?;
        Ok(Self { db })
    }

    /// Path to the backing database file
    pub fn path(&self) -> &PathBuf {
        self.db.path()
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }
}
