//! Connection handling and schema migrations
//!
//! Every operation opens its own connection: WAL journal for crash
//! durability, 5 s busy timeout for multi-reader/single-writer contention,
//! foreign keys on. Migrations are additive only - existing column sets are
//! inspected and missing columns added, never dropped or rewritten.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::Result;

/// Baseline schema
///
/// Later-added columns live in `ADDITIVE_COLUMNS`, not here, so upgrades and
/// fresh databases go through the same migration path.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                TEXT PRIMARY KEY,
    agent_id          TEXT,
    system_prompt     TEXT,
    model_id          TEXT NOT NULL,
    role              TEXT NOT NULL DEFAULT 'main',
    title             TEXT,
    work_directory    TEXT,
    created_at        TEXT NOT NULL,
    last_activity_at  TEXT NOT NULL,
    is_active         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    parent_message_id  TEXT,
    message_type       TEXT NOT NULL,
    agent_role         TEXT,
    agent_depth        INTEGER NOT NULL DEFAULT 0,
    model_id           TEXT,
    started_at         TEXT NOT NULL,
    completed_at       TEXT,
    duration_ms        INTEGER,
    request_content    TEXT,
    response_content   TEXT,
    tool_name          TEXT,
    tool_args          TEXT,
    tool_result        TEXT,
    files_modified     TEXT,
    files_created      TEXT,
    prompt_tokens      INTEGER,
    completion_tokens  INTEGER,
    total_tokens       INTEGER,
    iteration_number   INTEGER,
    max_iterations     INTEGER,
    max_duration_ms    INTEGER,
    bailout_reason     TEXT,
    status             TEXT NOT NULL DEFAULT 'pending',
    error_message      TEXT,
    is_summarized      INTEGER NOT NULL DEFAULT 0,
    summary_id         TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, started_at);
CREATE INDEX IF NOT EXISTS idx_messages_summary ON messages(session_id, is_summarized);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    request_content,
    response_content,
    tool_result,
    content='messages',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, request_content, response_content, tool_result)
    VALUES (new.rowid, new.request_content, new.response_content, new.tool_result);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, request_content, response_content, tool_result)
    VALUES ('delete', old.rowid, old.request_content, old.response_content, old.tool_result);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_update AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, request_content, response_content, tool_result)
    VALUES ('delete', old.rowid, old.request_content, old.response_content, old.tool_result);
    INSERT INTO messages_fts(rowid, request_content, response_content, tool_result)
    VALUES (new.rowid, new.request_content, new.response_content, new.tool_result);
END;

CREATE TABLE IF NOT EXISTS symbols (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    full_name     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    file_path     TEXT NOT NULL,
    line_start    INTEGER NOT NULL,
    line_end      INTEGER NOT NULL,
    column_start  INTEGER NOT NULL DEFAULT 0,
    signature     TEXT,
    documentation TEXT,
    parent_id     TEXT,
    visibility    TEXT,
    is_static     INTEGER NOT NULL DEFAULT 0,
    last_indexed  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_path);

CREATE TABLE IF NOT EXISTS symbol_refs (
    id         INTEGER PRIMARY KEY,
    symbol_id  TEXT NOT NULL REFERENCES symbols(id) ON DELETE CASCADE,
    file_path  TEXT NOT NULL,
    line       INTEGER NOT NULL,
    column     INTEGER NOT NULL DEFAULT 0,
    snippet    TEXT,
    kind       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_symbol_refs_symbol ON symbol_refs(symbol_id);

CREATE TABLE IF NOT EXISTS files (
    path          TEXT PRIMARY KEY,
    hash          TEXT NOT NULL,
    size          INTEGER NOT NULL,
    last_indexed  TEXT NOT NULL,
    symbol_count  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS context (
    key         TEXT NOT NULL,
    project     TEXT NOT NULL DEFAULT '',
    value       TEXT NOT NULL,
    kind        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    expires_at  TEXT,
    PRIMARY KEY (key, project)
);
"#;

/// Columns added after the baseline schema shipped
///
/// (table, column, declaration). Applied with `ALTER TABLE .. ADD COLUMN`
/// when `pragma table_info` shows the column missing.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("sessions", "metadata", "TEXT"),
    ("messages", "response_summary", "TEXT"),
    ("messages", "metadata", "TEXT"),
    ("symbols", "return_type", "TEXT"),
];

/// Database handle - path plus per-operation connection factory
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Open the database, configure pragmas, and run migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Self { path };
        let conn = db.conn()?;
        migrate(&conn)?;
        info!(path = %db.path.display(), "Store opened");
        Ok(db)
    }

    /// Open a short-lived connection for one operation
    pub fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Apply the baseline schema, then add any missing columns
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    for (table, column, decl) in ADDITIVE_COLUMNS {
        if !column_exists(conn, table, column)? {
            debug!(table, column, "Adding missing column");
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
        }
    }

    Ok(())
}

/// Check whether a column exists via pragma table_info
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let temp = tempdir().unwrap();
        let db = Db::open(temp.path().join("test.db")).unwrap();

        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN ('sessions', 'messages', 'symbols', 'files', 'context')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_additive_columns_applied() {
        let temp = tempdir().unwrap();
        let db = Db::open(temp.path().join("test.db")).unwrap();

        let conn = db.conn().unwrap();
        for (table, column, _) in ADDITIVE_COLUMNS {
            assert!(
                column_exists(&conn, table, column).unwrap(),
                "{table}.{column} missing after migration"
            );
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.db");

        Db::open(&path).unwrap();
        Db::open(&path).unwrap();
    }

    #[test]
    fn test_migration_adds_column_to_old_schema() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("old.db");

        // Simulate a database created before response_summary existed
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            assert!(!column_exists(&conn, "messages", "response_summary").unwrap());
        }

        Db::open(&path).unwrap();
        let conn = Connection::open(&path).unwrap();
        assert!(column_exists(&conn, "messages", "response_summary").unwrap());
    }
}
