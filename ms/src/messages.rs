//! Message lifecycle, summarization recording, and active-context replay
//!
//! A message is inserted in `running` state when the agent emits or receives
//! content, then completed or failed exactly once. Summarization inserts a
//! `summary` message and flags the contributing messages in one transaction
//! so replay never observes a half-recorded summary.

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Message, MessageStatus, MessageType};
use crate::{MemoryStore, Result, StoreError};

const MESSAGE_COLS: &str = "id, session_id, parent_message_id, message_type, agent_role, agent_depth, \
                            model_id, started_at, completed_at, duration_ms, request_content, \
                            response_content, response_summary, tool_name, tool_args, tool_result, \
                            files_modified, files_created, prompt_tokens, completion_tokens, \
                            total_tokens, iteration_number, max_iterations, max_duration_ms, \
                            bailout_reason, status, error_message, is_summarized, summary_id, metadata";

/// Fields captured when a message starts
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub session_id: String,
    pub parent_message_id: Option<String>,
    pub message_type: Option<MessageType>,
    pub agent_role: Option<String>,
    pub agent_depth: i64,
    pub model_id: Option<String>,
    pub request_content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<String>,
    pub iteration_number: Option<i64>,
    pub max_iterations: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub metadata: Option<String>,
}

impl NewMessage {
    /// Start a message of the given type in a session
    pub fn of(session_id: &str, message_type: MessageType) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_type: Some(message_type),
            ..Default::default()
        }
    }
}

/// Fields recorded when a message completes
#[derive(Debug, Clone, Default)]
pub struct MessageCompletion {
    pub response_content: Option<String>,
    pub response_summary: Option<String>,
    pub tool_result: Option<String>,
    pub files_modified: Vec<String>,
    pub files_created: Vec<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

fn conversion_err(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, detail)),
    )
}

pub(crate) fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let type_str: String = row.get(3)?;
    let message_type =
        MessageType::parse(&type_str).ok_or_else(|| conversion_err(3, format!("unknown message type: {type_str}")))?;

    let status_str: String = row.get(25)?;
    let status = MessageStatus::parse(&status_str)
        .ok_or_else(|| conversion_err(25, format!("unknown message status: {status_str}")))?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_message_id: row.get(2)?,
        message_type,
        agent_role: row.get(4)?,
        agent_depth: row.get(5)?,
        model_id: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        duration_ms: row.get(9)?,
        request_content: row.get(10)?,
        response_content: row.get(11)?,
        response_summary: row.get(12)?,
        tool_name: row.get(13)?,
        tool_args: row.get(14)?,
        tool_result: row.get(15)?,
        files_modified: row.get(16)?,
        files_created: row.get(17)?,
        prompt_tokens: row.get(18)?,
        completion_tokens: row.get(19)?,
        total_tokens: row.get(20)?,
        iteration_number: row.get(21)?,
        max_iterations: row.get(22)?,
        max_duration_ms: row.get(23)?,
        bailout_reason: row.get(24)?,
        status,
        error_message: row.get(26)?,
        is_summarized: row.get(27)?,
        summary_id: row.get(28)?,
        metadata: row.get(29)?,
    })
}

fn files_json(files: &[String]) -> Option<String> {
    if files.is_empty() {
        None
    } else {
        serde_json::to_string(files).ok()
    }
}

impl MemoryStore {
    /// Insert a message in `running` state
    pub fn append_message(&self, new: NewMessage) -> Result<Message> {
        let message_type = new
            .message_type
            .ok_or_else(|| StoreError::Invalid("message_type is required".to_string()))?;
        if new.session_id.is_empty() {
            return Err(StoreError::Invalid("session_id is required".to_string()));
        }

        let message = Message {
            id: Uuid::now_v7().to_string(),
            session_id: new.session_id,
            parent_message_id: new.parent_message_id,
            message_type,
            agent_role: new.agent_role,
            agent_depth: new.agent_depth,
            model_id: new.model_id,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            request_content: new.request_content,
            response_content: None,
            response_summary: None,
            tool_name: new.tool_name,
            tool_args: new.tool_args,
            tool_result: None,
            files_modified: None,
            files_created: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            iteration_number: new.iteration_number,
            max_iterations: new.max_iterations,
            max_duration_ms: new.max_duration_ms,
            bailout_reason: None,
            status: MessageStatus::Running,
            error_message: None,
            is_summarized: false,
            summary_id: None,
            metadata: new.metadata,
        };

        let conn = self.db().conn()?;
        conn.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                  ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"
            ),
            params![
                message.id,
                message.session_id,
                message.parent_message_id,
                message.message_type.as_str(),
                message.agent_role,
                message.agent_depth,
                message.model_id,
                message.started_at,
                message.completed_at,
                message.duration_ms,
                message.request_content,
                message.response_content,
                message.response_summary,
                message.tool_name,
                message.tool_args,
                message.tool_result,
                message.files_modified,
                message.files_created,
                message.prompt_tokens,
                message.completion_tokens,
                message.total_tokens,
                message.iteration_number,
                message.max_iterations,
                message.max_duration_ms,
                message.bailout_reason,
                message.status.as_str(),
                message.error_message,
                message.is_summarized,
                message.summary_id,
                message.metadata,
            ],
        )?;

        // Session activity follows every message write
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![message.started_at, message.session_id],
        )?;

        debug!(message_id = %message.id, session_id = %message.session_id, r#type = message.message_type.as_str(), "Message appended");
        Ok(message)
    }

    /// Record a successful completion
    pub fn complete_message(&self, id: &str, done: MessageCompletion) -> Result<()> {
        let conn = self.db().conn()?;

        let started_at: Option<chrono::DateTime<Utc>> = conn
            .query_row("SELECT started_at FROM messages WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let started_at = started_at.ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0);

        conn.execute(
            "UPDATE messages SET status = 'completed', completed_at = ?1, duration_ms = ?2, \
             response_content = ?3, response_summary = ?4, tool_result = ?5, \
             files_modified = ?6, files_created = ?7, \
             prompt_tokens = ?8, completion_tokens = ?9, total_tokens = ?10 \
             WHERE id = ?11",
            params![
                completed_at,
                duration_ms,
                done.response_content,
                done.response_summary,
                done.tool_result,
                files_json(&done.files_modified),
                files_json(&done.files_created),
                done.prompt_tokens,
                done.completion_tokens,
                done.total_tokens,
                id,
            ],
        )?;
        Ok(())
    }

    /// Record a failure, cancellation, or timeout
    pub fn fail_message(
        &self,
        id: &str,
        status: MessageStatus,
        error: &str,
        bailout_reason: Option<&str>,
    ) -> Result<()> {
        if !matches!(
            status,
            MessageStatus::Failed | MessageStatus::Cancelled | MessageStatus::Timeout
        ) {
            return Err(StoreError::Invalid(format!(
                "fail_message requires a failure status, got {}",
                status.as_str()
            )));
        }

        let conn = self.db().conn()?;
        let changed = conn.execute(
            "UPDATE messages SET status = ?1, completed_at = ?2, error_message = ?3, bailout_reason = ?4 \
             WHERE id = ?5",
            params![status.as_str(), Utc::now(), error, bailout_reason, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    /// Get a message by id
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.db().conn()?;
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                params![id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// All messages of a session in replay order
    pub fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages WHERE session_id = ?1 ORDER BY started_at, rowid"
        ))?;
        let messages = stmt
            .query_map(params![session_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Transactionally record a summary over the given messages
    ///
    /// Inserts a `summary` message and marks every contributor with
    /// `is_summarized = 1` and `summary_id` pointing back at it. The summary's
    /// `started_at` is backdated to the earliest contributor so replay ordering
    /// places it where the summarized range began.
    pub fn record_summary(
        &self,
        session_id: &str,
        summary_text: &str,
        model_id: Option<&str>,
        contributing: &[String],
    ) -> Result<Message> {
        if contributing.is_empty() {
            return Err(StoreError::Invalid("summary needs at least one contributing message".to_string()));
        }

        let mut conn = self.db().conn()?;
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; contributing.len()].join(", ");
        let range_start: Option<chrono::DateTime<Utc>> = tx
            .query_row(
                &format!(
                    "SELECT min(started_at) FROM messages WHERE session_id = ?1 AND id IN ({placeholders})"
                ),
                rusqlite::params_from_iter(
                    std::iter::once(session_id.to_string()).chain(contributing.iter().cloned()),
                ),
                |row| row.get(0),
            )?;
        let started_at = range_start.ok_or_else(|| {
            StoreError::Invalid("contributing messages not found in session".to_string())
        })?;

        let now = Utc::now();
        let summary = Message {
            id: Uuid::now_v7().to_string(),
            session_id: session_id.to_string(),
            parent_message_id: None,
            message_type: MessageType::Summary,
            agent_role: None,
            agent_depth: 0,
            model_id: model_id.map(str::to_string),
            started_at,
            completed_at: Some(now),
            duration_ms: Some(0),
            request_content: None,
            response_content: Some(summary_text.to_string()),
            response_summary: None,
            tool_name: None,
            tool_args: None,
            tool_result: None,
            files_modified: None,
            files_created: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            iteration_number: None,
            max_iterations: None,
            max_duration_ms: None,
            bailout_reason: None,
            status: MessageStatus::Completed,
            error_message: None,
            is_summarized: false,
            summary_id: None,
            metadata: None,
        };

        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                  ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"
            ),
            params![
                summary.id,
                summary.session_id,
                summary.parent_message_id,
                summary.message_type.as_str(),
                summary.agent_role,
                summary.agent_depth,
                summary.model_id,
                summary.started_at,
                summary.completed_at,
                summary.duration_ms,
                summary.request_content,
                summary.response_content,
                summary.response_summary,
                summary.tool_name,
                summary.tool_args,
                summary.tool_result,
                summary.files_modified,
                summary.files_created,
                summary.prompt_tokens,
                summary.completion_tokens,
                summary.total_tokens,
                summary.iteration_number,
                summary.max_iterations,
                summary.max_duration_ms,
                summary.bailout_reason,
                summary.status.as_str(),
                summary.error_message,
                summary.is_summarized,
                summary.summary_id,
                summary.metadata,
            ],
        )?;

        let flagged = tx.execute(
            &format!(
                "UPDATE messages SET is_summarized = 1, summary_id = ?1 \
                 WHERE session_id = ?2 AND id IN ({placeholders})"
            ),
            rusqlite::params_from_iter(
                [summary.id.clone(), session_id.to_string()]
                    .into_iter()
                    .chain(contributing.iter().cloned()),
            ),
        )?;

        tx.commit()?;

        info!(
            session_id = %session_id,
            summary_id = %summary.id,
            flagged,
            "Summary recorded"
        );
        Ok(summary)
    }

    /// Reconstruct the active context for the next LLM turn
    ///
    /// If a summary exists: the latest summary followed by every
    /// non-summarized, non-system, non-summary message strictly after the
    /// summary's `started_at`. Otherwise: all non-summarized, non-system
    /// messages. Ordered by start time with insertion order as tiebreaker.
    pub fn active_context(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.db().conn()?;

        let latest_summary = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM messages \
                     WHERE session_id = ?1 AND message_type = 'summary' \
                     ORDER BY completed_at DESC, rowid DESC LIMIT 1"
                ),
                params![session_id],
                message_from_row,
            )
            .optional()?;

        match latest_summary {
            Some(summary) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages \
                     WHERE session_id = ?1 AND is_summarized = 0 \
                       AND message_type NOT IN ('system', 'summary') \
                       AND started_at > ?2 \
                     ORDER BY started_at, rowid"
                ))?;
                let tail = stmt
                    .query_map(params![session_id, summary.started_at], message_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut context = Vec::with_capacity(tail.len() + 1);
                context.push(summary);
                context.extend(tail);
                Ok(context)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages \
                     WHERE session_id = ?1 AND is_summarized = 0 AND message_type != 'system' \
                     ORDER BY started_at, rowid"
                ))?;
                let messages = stmt
                    .query_map(params![session_id], message_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(messages)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewSession;
    use tempfile::tempdir;

    fn store_with_session() -> (tempfile::TempDir, MemoryStore, String) {
        let temp = tempdir().unwrap();
        let store = MemoryStore::open(temp.path().join("test.db")).unwrap();
        let session = store
            .create_session(NewSession {
                model_id: "claude-sonnet-4".to_string(),
                role: "coder".to_string(),
                ..Default::default()
            })
            .unwrap();
        (temp, store, session.id)
    }

    fn append(store: &MemoryStore, session_id: &str, mt: MessageType, text: &str) -> Message {
        let mut new = NewMessage::of(session_id, mt);
        new.request_content = Some(text.to_string());
        store.append_message(new).unwrap()
    }

    #[test]
    fn test_append_complete_roundtrip() {
        let (_temp, store, sid) = store_with_session();

        let msg = append(&store, &sid, MessageType::Assistant, "do the thing");
        assert_eq!(msg.status, MessageStatus::Running);

        store
            .complete_message(
                &msg.id,
                MessageCompletion {
                    response_content: Some("done".to_string()),
                    prompt_tokens: Some(100),
                    completion_tokens: Some(20),
                    total_tokens: Some(120),
                    ..Default::default()
                },
            )
            .unwrap();

        let fetched = store.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Completed);
        assert_eq!(fetched.response_content.as_deref(), Some("done"));
        assert_eq!(fetched.total_tokens, Some(120));
        assert!(fetched.completed_at.unwrap() >= fetched.started_at);
    }

    #[test]
    fn test_fail_message_records_bailout() {
        let (_temp, store, sid) = store_with_session();

        let msg = append(&store, &sid, MessageType::ToolCall, "run tests");
        store
            .fail_message(&msg.id, MessageStatus::Timeout, "tool timed out", Some("tool_timeout"))
            .unwrap();

        let fetched = store.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Timeout);
        assert_eq!(fetched.bailout_reason.as_deref(), Some("tool_timeout"));
    }

    #[test]
    fn test_fail_message_rejects_success_status() {
        let (_temp, store, sid) = store_with_session();
        let msg = append(&store, &sid, MessageType::User, "hi");

        let result = store.fail_message(&msg.id, MessageStatus::Completed, "x", None);
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_summarization_replay() {
        let (_temp, store, sid) = store_with_session();

        // Ten completed messages m1..m10
        let mut ids = Vec::new();
        for i in 1..=10 {
            let msg = append(&store, &sid, MessageType::Assistant, &format!("message {i}"));
            store.complete_message(&msg.id, MessageCompletion::default()).unwrap();
            ids.push(msg.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        // Summarize m1..m6
        let summary = store
            .record_summary(&sid, "summary of m1-m6", Some("claude-haiku"), &ids[..6])
            .unwrap();
        assert_eq!(summary.message_type, MessageType::Summary);

        for id in &ids[..6] {
            let m = store.get_message(id).unwrap().unwrap();
            assert!(m.is_summarized);
            assert_eq!(m.summary_id.as_deref(), Some(summary.id.as_str()));
        }
        for id in &ids[6..] {
            let m = store.get_message(id).unwrap().unwrap();
            assert!(!m.is_summarized);
        }

        // Replay: [summary, m7, m8, m9, m10]
        let context = store.active_context(&sid).unwrap();
        assert_eq!(context.len(), 5);
        assert_eq!(context[0].id, summary.id);
        for (got, want) in context[1..].iter().zip(&ids[6..]) {
            assert_eq!(&got.id, want);
        }
    }

    #[test]
    fn test_active_context_without_summary() {
        let (_temp, store, sid) = store_with_session();

        append(&store, &sid, MessageType::System, "system prompt");
        let m1 = append(&store, &sid, MessageType::User, "hello");
        let m2 = append(&store, &sid, MessageType::Assistant, "hi");

        let context = store.active_context(&sid).unwrap();
        let ids: Vec<_> = context.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![m1.id.as_str(), m2.id.as_str()]);
    }

    #[test]
    fn test_record_summary_requires_contributors() {
        let (_temp, store, sid) = store_with_session();
        let result = store.record_summary(&sid, "empty", None, &[]);
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_second_summary_wins() {
        let (_temp, store, sid) = store_with_session();

        let mut ids = Vec::new();
        for i in 0..4 {
            let msg = append(&store, &sid, MessageType::Assistant, &format!("m{i}"));
            store.complete_message(&msg.id, MessageCompletion::default()).unwrap();
            ids.push(msg.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let first = store.record_summary(&sid, "first", None, &ids[..2]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        // The second summary covers everything, including the first summary's tail
        let second = store.record_summary(&sid, "second", None, &ids).unwrap();
        assert_ne!(first.id, second.id);

        let context = store.active_context(&sid).unwrap();
        assert_eq!(context[0].id, second.id);
        // All four messages are summarized now; only the summary remains
        assert_eq!(context.len(), 1);
    }
}
