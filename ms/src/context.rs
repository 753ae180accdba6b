//! Key/value context memory
//!
//! Decisions, patterns, preferences, notes, and errors remembered across
//! sessions, optionally scoped to a project and optionally expiring.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};

use crate::types::ContextKind;
use crate::{MemoryStore, Result, StoreError};

/// A remembered key/value entry
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub key: String,

    /// Empty string means global scope
    pub project: String,

    pub value: String,
    pub kind: ContextKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContextEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

fn entry_from_row(row: &Row) -> rusqlite::Result<ContextEntry> {
    let kind_str: String = row.get(3)?;
    let kind = ContextKind::parse(&kind_str).unwrap_or(ContextKind::Note);

    Ok(ContextEntry {
        key: row.get(0)?,
        project: row.get(1)?,
        value: row.get(2)?,
        kind,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

impl MemoryStore {
    /// Store or overwrite a context entry
    pub fn set_context(
        &self,
        key: &str,
        value: &str,
        kind: ContextKind,
        project: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(StoreError::Invalid("context key is required".to_string()));
        }

        let now = Utc::now();
        let expires_at = ttl.map(|t| now + t);

        let conn = self.db().conn()?;
        conn.execute(
            "INSERT INTO context (key, project, value, kind, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(key, project) DO UPDATE SET \
               value = excluded.value, kind = excluded.kind, \
               created_at = excluded.created_at, expires_at = excluded.expires_at",
            params![key, project.unwrap_or(""), value, kind.as_str(), now, expires_at],
        )?;
        Ok(())
    }

    /// Fetch a context entry; expired entries read as absent
    pub fn get_context(&self, key: &str, project: Option<&str>) -> Result<Option<ContextEntry>> {
        let conn = self.db().conn()?;
        let entry = conn
            .query_row(
                "SELECT key, project, value, kind, created_at, expires_at \
                 FROM context WHERE key = ?1 AND project = ?2",
                params![key, project.unwrap_or("")],
                entry_from_row,
            )
            .optional()?;

        Ok(entry.filter(|e| !e.is_expired(Utc::now())))
    }

    /// List non-expired entries, optionally restricted to one project
    pub fn list_context(&self, project: Option<&str>) -> Result<Vec<ContextEntry>> {
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, project, value, kind, created_at, expires_at \
             FROM context WHERE (?1 IS NULL OR project = ?1) ORDER BY project, key",
        )?;
        let now = Utc::now();
        let entries = stmt
            .query_map(params![project], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .collect();
        Ok(entries)
    }

    /// Remove an entry; returns whether it existed
    pub fn delete_context(&self, key: &str, project: Option<&str>) -> Result<bool> {
        let conn = self.db().conn()?;
        let changed = conn.execute(
            "DELETE FROM context WHERE key = ?1 AND project = ?2",
            params![key, project.unwrap_or("")],
        )?;
        Ok(changed > 0)
    }

    /// Physically delete expired entries
    pub fn purge_expired_context(&self) -> Result<usize> {
        let conn = self.db().conn()?;
        let purged = conn.execute(
            "DELETE FROM context WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Utc::now()],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let temp = tempdir().unwrap();
        let store = MemoryStore::open(temp.path().join("test.db")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (_temp, store) = store();

        store
            .set_context("style", "tabs not spaces", ContextKind::Preference, None, None)
            .unwrap();

        let entry = store.get_context("style", None).unwrap().unwrap();
        assert_eq!(entry.value, "tabs not spaces");
        assert_eq!(entry.kind, ContextKind::Preference);
    }

    #[test]
    fn test_project_scoping() {
        let (_temp, store) = store();

        store
            .set_context("db", "postgres", ContextKind::Decision, Some("api"), None)
            .unwrap();
        store
            .set_context("db", "sqlite", ContextKind::Decision, Some("cli"), None)
            .unwrap();

        assert_eq!(store.get_context("db", Some("api")).unwrap().unwrap().value, "postgres");
        assert_eq!(store.get_context("db", Some("cli")).unwrap().unwrap().value, "sqlite");
        assert!(store.get_context("db", None).unwrap().is_none());

        assert_eq!(store.list_context(Some("api")).unwrap().len(), 1);
        assert_eq!(store.list_context(None).unwrap().len(), 2);
    }

    #[test]
    fn test_overwrite_same_key() {
        let (_temp, store) = store();

        store
            .set_context("k", "v1", ContextKind::Note, None, None)
            .unwrap();
        store
            .set_context("k", "v2", ContextKind::Note, None, None)
            .unwrap();

        assert_eq!(store.get_context("k", None).unwrap().unwrap().value, "v2");
        assert_eq!(store.list_context(None).unwrap().len(), 1);
    }

    #[test]
    fn test_expired_entries_hidden_and_purged() {
        let (_temp, store) = store();

        store
            .set_context("gone", "x", ContextKind::Note, None, Some(Duration::milliseconds(-1)))
            .unwrap();
        store
            .set_context("kept", "y", ContextKind::Note, None, Some(Duration::days(1)))
            .unwrap();

        assert!(store.get_context("gone", None).unwrap().is_none());
        assert_eq!(store.list_context(None).unwrap().len(), 1);

        assert_eq!(store.purge_expired_context().unwrap(), 1);
        assert_eq!(store.get_context("kept", None).unwrap().unwrap().value, "y");
    }

    #[test]
    fn test_delete() {
        let (_temp, store) = store();

        store.set_context("k", "v", ContextKind::Note, None, None).unwrap();
        assert!(store.delete_context("k", None).unwrap());
        assert!(!store.delete_context("k", None).unwrap());
    }
}
