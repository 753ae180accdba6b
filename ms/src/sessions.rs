//! Session CRUD and activity tracking

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::Session;
use crate::{MemoryStore, Result, StoreError};

const SESSION_COLS: &str = "id, agent_id, system_prompt, model_id, role, title, work_directory, \
                            created_at, last_activity_at, is_active, metadata";

/// Fields required to create a session
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub agent_id: Option<String>,
    pub system_prompt: Option<String>,
    pub model_id: String,
    pub role: String,
    pub title: Option<String>,
    pub work_directory: Option<String>,
    pub metadata: Option<String>,
}

pub(crate) fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        system_prompt: row.get(2)?,
        model_id: row.get(3)?,
        role: row.get(4)?,
        title: row.get(5)?,
        work_directory: row.get(6)?,
        created_at: row.get(7)?,
        last_activity_at: row.get(8)?,
        is_active: row.get(9)?,
        metadata: row.get(10)?,
    })
}

impl MemoryStore {
    /// Create a new session
    pub fn create_session(&self, new: NewSession) -> Result<Session> {
        if new.model_id.is_empty() {
            return Err(StoreError::Invalid("model_id is required".to_string()));
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::now_v7().to_string(),
            agent_id: new.agent_id,
            system_prompt: new.system_prompt,
            model_id: new.model_id,
            role: if new.role.is_empty() { "main".to_string() } else { new.role },
            title: new.title,
            work_directory: new.work_directory,
            created_at: now,
            last_activity_at: now,
            is_active: true,
            metadata: new.metadata,
        };

        let conn = self.db().conn()?;
        conn.execute(
            &format!("INSERT INTO sessions ({SESSION_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                session.id,
                session.agent_id,
                session.system_prompt,
                session.model_id,
                session.role,
                session.title,
                session.work_directory,
                session.created_at,
                session.last_activity_at,
                session.is_active,
                session.metadata,
            ],
        )?;

        info!(session_id = %session.id, role = %session.role, "Session created");
        Ok(session)
    }

    /// Get a session by id
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.db().conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Bump a session's last-activity timestamp
    pub fn touch_session(&self, id: &str) -> Result<()> {
        let conn = self.db().conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Toggle a session's active flag
    pub fn set_session_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = self.db().conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET is_active = ?1, last_activity_at = ?2 WHERE id = ?3",
            params![active, Utc::now(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// List sessions, newest activity first
    pub fn list_sessions(&self, active_only: bool) -> Result<Vec<Session>> {
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions WHERE (?1 = 0 OR is_active = 1) ORDER BY last_activity_at DESC"
        ))?;
        let sessions = stmt
            .query_map(params![active_only], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Delete a session and (by cascade) its messages
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.db().conn()?;
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        info!(session_id = %id, "Session deleted");
        Ok(())
    }

    /// Clear the active flag on sessions idle longer than `idle_days`
    pub fn retire_idle_sessions(&self, idle_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(idle_days);
        let conn = self.db().conn()?;
        let retired = conn.execute(
            "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity_at < ?1",
            params![cutoff],
        )?;
        if retired > 0 {
            debug!(retired, idle_days, "Retired idle sessions");
        }
        Ok(retired)
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

    fn new_session(role: &str) -> NewSession {
        NewSession {
            model_id: "claude-sonnet-4".to_string(),
            role: role.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get_session() {
        let (_temp, store) = store();

        let created = store.create_session(new_session("coder")).unwrap();
        let fetched = store.get_session(&created.id).unwrap().unwrap();

        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.role, "coder");
        assert!(fetched.is_active);
    }

    #[test]
    fn test_create_session_requires_model() {
        let (_temp, store) = store();

        let result = store.create_session(NewSession::default());
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_touch_updates_activity() {
        let (_temp, store) = store();

        let created = store.create_session(new_session("main")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.touch_session(&created.id).unwrap();

        let fetched = store.get_session(&created.id).unwrap().unwrap();
        assert!(fetched.last_activity_at > created.last_activity_at);
    }

    #[test]
    fn test_touch_missing_session() {
        let (_temp, store) = store();
        assert!(matches!(
            store.touch_session("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_active_only() {
        let (_temp, store) = store();

        let a = store.create_session(new_session("main")).unwrap();
        let b = store.create_session(new_session("coder")).unwrap();
        store.set_session_active(&b.id, false).unwrap();

        let active = store.list_sessions(true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let all = store.list_sessions(false).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_delete_session() {
        let (_temp, store) = store();

        let created = store.create_session(new_session("main")).unwrap();
        store.delete_session(&created.id).unwrap();

        assert!(store.get_session(&created.id).unwrap().is_none());
        assert!(matches!(
            store.delete_session(&created.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_retire_idle_sessions() {
        let (_temp, store) = store();

        let session = store.create_session(new_session("main")).unwrap();

        // Nothing is idle yet
        assert_eq!(store.retire_idle_sessions(30).unwrap(), 0);

        // Backdate activity past the cutoff
        let conn = store.db().conn().unwrap();
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![Utc::now() - Duration::days(31), session.id],
        )
        .unwrap();

        assert_eq!(store.retire_idle_sessions(30).unwrap(), 1);
        let fetched = store.get_session(&session.id).unwrap().unwrap();
        assert!(!fetched.is_active);
    }
}
