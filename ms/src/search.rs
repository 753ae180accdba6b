//! Full-text search over message text
//!
//! Queries go through [`build_match_query`] so user input can never reach the
//! FTS engine as raw query syntax: long natural-language queries become a
//! single quoted phrase, short ones become prefix-matched tokens.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use crate::{MemoryStore, Result};

/// Options for a message search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Session whose hits sort first regardless of FTS rank
    pub current_session_id: Option<String>,

    /// Include messages still pending/running
    pub include_in_flight: bool,

    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            current_session_id: None,
            include_in_flight: false,
            limit: 20,
        }
    }
}

/// A single search hit
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub snippet: String,
}

/// Build an FTS-safe MATCH expression from user input
///
/// Natural-language queries of three or more words are wrapped as one quoted
/// phrase (embedded quotes doubled). Shorter queries are tokenized, each token
/// quoted and prefix-matched, so single words still recall partial matches.
pub fn build_match_query(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    let words: Vec<&str> = escaped.split_whitespace().collect();

    if words.len() >= 3 {
        format!("\"{}\"", words.join(" "))
    } else {
        words
            .iter()
            .map(|w| format!("\"{w}\"*"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl MemoryStore {
    /// Search message text across all sessions
    ///
    /// Hits from `current_session_id` are returned before other sessions'
    /// hits; within a group, FTS rank decides.
    pub fn search_messages(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let match_query = build_match_query(query);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }

        debug!(%query, %match_query, "Searching messages");

        let conn = self.db().conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.session_id, m.started_at, \
                    snippet(messages_fts, -1, '[', ']', '…', 12) \
             FROM messages_fts \
             JOIN messages m ON m.rowid = messages_fts.rowid \
             WHERE messages_fts MATCH ?1 \
               AND (?2 OR m.status NOT IN ('pending', 'running')) \
             ORDER BY CASE WHEN m.session_id = ?3 THEN 0 ELSE 1 END, rank \
             LIMIT ?4",
        )?;

        let hits = stmt
            .query_map(
                params![
                    match_query,
                    opts.include_in_flight,
                    opts.current_session_id,
                    opts.limit as i64,
                ],
                |row| {
                    Ok(SearchHit {
                        message_id: row.get(0)?,
                        session_id: row.get(1)?,
                        started_at: row.get(2)?,
                        snippet: row.get(3)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use crate::{MessageCompletion, NewMessage, NewSession};
    use tempfile::tempdir;

    #[test]
    fn test_match_query_phrase_for_long_input() {
        assert_eq!(
            build_match_query("refactor the session store"),
            "\"refactor the session store\""
        );
    }

    #[test]
    fn test_match_query_prefix_for_short_input() {
        assert_eq!(build_match_query("refactor"), "\"refactor\"*");
        assert_eq!(build_match_query("session store"), "\"session\"* \"store\"*");
    }

    #[test]
    fn test_match_query_escapes_quotes() {
        assert_eq!(
            build_match_query("say \"hello\" to everyone"),
            "\"say \"\"hello\"\" to everyone\""
        );
    }

    #[test]
    fn test_match_query_empty() {
        assert_eq!(build_match_query(""), "");
        assert_eq!(build_match_query("   "), "");
    }

    fn setup() -> (tempfile::TempDir, MemoryStore, String, String) {
        let temp = tempdir().unwrap();
        let store = MemoryStore::open(temp.path().join("test.db")).unwrap();
        let s1 = store
            .create_session(NewSession {
                model_id: "claude-sonnet-4".to_string(),
                ..Default::default()
            })
            .unwrap();
        let s2 = store
            .create_session(NewSession {
                model_id: "claude-sonnet-4".to_string(),
                ..Default::default()
            })
            .unwrap();
        (temp, store, s1.id, s2.id)
    }

    fn completed_message(store: &MemoryStore, session_id: &str, text: &str) -> String {
        let mut new = NewMessage::of(session_id, MessageType::Assistant);
        new.request_content = Some(text.to_string());
        let msg = store.append_message(new).unwrap();
        store
            .complete_message(&msg.id, MessageCompletion::default())
            .unwrap();
        msg.id
    }

    #[test]
    fn test_search_finds_messages() {
        let (_temp, store, s1, _s2) = setup();

        completed_message(&store, &s1, "let us refactor the parser");
        completed_message(&store, &s1, "unrelated content entirely");

        let hits = store
            .search_messages("refactor", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("refactor"));
    }

    #[test]
    fn test_search_prioritizes_current_session() {
        let (_temp, store, s1, s2) = setup();

        // s2's message is inserted first, so raw FTS order would surface it first
        completed_message(&store, &s2, "refactor the scheduler");
        completed_message(&store, &s1, "refactor the scheduler");

        let hits = store
            .search_messages(
                "refactor",
                &SearchOptions {
                    current_session_id: Some(s1.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].session_id, s1);
    }

    #[test]
    fn test_search_excludes_in_flight_by_default() {
        let (_temp, store, s1, _s2) = setup();

        // Running message - never completed
        let mut new = NewMessage::of(&s1, MessageType::Assistant);
        new.request_content = Some("refactor in flight".to_string());
        store.append_message(new).unwrap();

        let hits = store
            .search_messages("refactor", &SearchOptions::default())
            .unwrap();
        assert!(hits.is_empty());

        let hits = store
            .search_messages(
                "refactor",
                &SearchOptions {
                    include_in_flight: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
