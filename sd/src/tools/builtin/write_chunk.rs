//! write_chunk tool - chunked file assembly
//!
//! For outputs the model risks truncating in one call. Chunks must arrive in
//! order; the final chunk goes through the same atomic-write path as
//! write_file. Abandoned states are garbage-collected after ten minutes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::tools::{Tool, ToolContext, ToolResult};

use super::write_file::{WriteOptions, atomic_write, line_count, sha256_hex};

const STALE_AFTER: Duration = Duration::from_secs(600);

/// Accumulating state for one path
struct ChunkState {
    accumulator: String,
    total: u64,
    received: u64,
    started_at: Instant,
    expected_hash: Option<String>,
    display_path: String,
}

/// Reassemble a file from sequential chunks
pub struct WriteChunkTool {
    states: Mutex<HashMap<PathBuf, ChunkState>>,
}

impl WriteChunkTool {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    fn gc_stale(&self) {
        let mut states = self.states.lock().unwrap();
        let before = states.len();
        states.retain(|_, s| s.started_at.elapsed() < STALE_AFTER);
        let dropped = before - states.len();
        if dropped > 0 {
            debug!(dropped, "Garbage-collected stale chunk states");
        }
    }
}

impl Default for WriteChunkTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WriteChunkTool {
    fn name(&self) -> &'static str {
        "write_chunk"
    }

    fn description(&self) -> &'static str {
        "Write one chunk of a large file. Send chunks in order starting at 1; \
         the file is written atomically when the last chunk arrives."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the work directory"
                },
                "content": {
                    "type": "string",
                    "description": "This chunk's content"
                },
                "chunk_number": {
                    "type": "integer",
                    "description": "1-based chunk index"
                },
                "total_chunks": {
                    "type": "integer",
                    "description": "Total number of chunks"
                },
                "expected_hash": {
                    "type": "string",
                    "description": "sha256 the current file must match (checked on chunk 1)"
                }
            },
            "required": ["path", "content", "chunk_number", "total_chunks"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        self.gc_stale();

        let Some(path) = input["path"].as_str() else {
            return ToolResult::error_json(json!({"success": false, "error": "missing_field", "field": "path"}));
        };
        let Some(content) = input["content"].as_str() else {
            return ToolResult::error_json(json!({"success": false, "error": "missing_field", "field": "content"}));
        };
        let Some(chunk_number) = input["chunk_number"].as_u64() else {
            return ToolResult::error_json(
                json!({"success": false, "error": "missing_field", "field": "chunk_number"}),
            );
        };
        let Some(total_chunks) = input["total_chunks"].as_u64() else {
            return ToolResult::error_json(
                json!({"success": false, "error": "missing_field", "field": "total_chunks"}),
            );
        };
        if total_chunks == 0 || chunk_number == 0 {
            return ToolResult::error_json(json!({
                "success": false,
                "error": "invalid_arguments",
                "message": "chunk_number and total_chunks are 1-based",
            }));
        }

        let target = match ctx.validate_path(Path::new(path)) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "success": false,
                    "error": "permission_denied",
                    "path": path,
                    "message": e.to_string(),
                }));
            }
        };

        if chunk_number == 1 {
            // First chunk validates the preflight hash before any state exists
            let expected_hash = input["expected_hash"].as_str().map(str::to_string);
            if let Some(expected) = expected_hash.as_deref()
                && let Ok(current) = tokio::fs::read(&target).await
            {
                let actual = sha256_hex(&current);
                if actual != expected {
                    return ToolResult::error_json(json!({
                        "success": false,
                        "error": "checksum_mismatch",
                        "path": path,
                        "expected_sha256": expected,
                        "actual_sha256": actual,
                    }));
                }
            }

            let mut states = self.states.lock().unwrap();
            states.insert(
                target.clone(),
                ChunkState {
                    accumulator: content.to_string(),
                    total: total_chunks,
                    received: 1,
                    started_at: Instant::now(),
                    expected_hash,
                    display_path: path.to_string(),
                },
            );
        } else {
            let mut states = self.states.lock().unwrap();
            let Some(state) = states.get_mut(&target) else {
                return ToolResult::error_json(json!({
                    "success": false,
                    "error": "wrong_chunk_order",
                    "path": path,
                    "message": "no chunk state for this path; start with chunk 1",
                }));
            };

            if chunk_number != state.received + 1 || total_chunks != state.total {
                let expected = state.received + 1;
                let envelope = json!({
                    "success": false,
                    "error": "wrong_chunk_order",
                    "path": path,
                    "expected_chunk": expected,
                    "received_chunk": chunk_number,
                });
                states.remove(&target);
                return ToolResult::error_json(envelope);
            }

            state.accumulator.push_str(content);
            state.received = chunk_number;
        }

        // Check completion and pull the state out before any await
        let finished = {
            let mut states = self.states.lock().unwrap();
            let done = states.get(&target).map(|s| s.received == s.total).unwrap_or(false);
            if done { states.remove(&target) } else { None }
        };

        match finished {
            Some(state) => {
                let opts = WriteOptions {
                    expected_hash: state.expected_hash,
                    create_intermediate_dirs: false,
                    backup: true,
                };
                let write_result = atomic_write(&target, &state.display_path, &state.accumulator, &opts).await;
                if write_result.is_error {
                    return write_result;
                }

                ctx.schedule_reindex(&target);
                ToolResult::success_json(json!({
                    "success": true,
                    "complete": true,
                    "path": state.display_path,
                    "size_bytes": state.accumulator.len(),
                    "lines": line_count(&state.accumulator),
                    "sha256": sha256_hex(state.accumulator.as_bytes()),
                }))
            }
            None => ToolResult::success_json(json!({
                "success": true,
                "complete": false,
                "path": path,
                "received": chunk_number,
                "total": total_chunks,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(temp: &tempfile::TempDir) -> ToolContext {
        ToolContext::new(temp.path().to_path_buf(), "test".to_string())
    }

    #[tokio::test]
    async fn test_two_chunks_equal_atomic_write() {
        let temp = tempdir().unwrap();
        let tool = WriteChunkTool::new();

        let first = tool
            .execute(
                json!({"path": "out.txt", "content": "HELLO ", "chunk_number": 1, "total_chunks": 2}),
                &ctx(&temp),
            )
            .await;
        let envelope = first.as_json().unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["complete"], false);

        let second = tool
            .execute(
                json!({"path": "out.txt", "content": "WORLD\n", "chunk_number": 2, "total_chunks": 2}),
                &ctx(&temp),
            )
            .await;
        let envelope = second.as_json().unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["complete"], true);
        assert_eq!(envelope["size_bytes"], 12);
        assert_eq!(envelope["lines"], 2);

        // Byte-for-byte identical to a single atomic write
        let direct = temp.path().join("direct.txt");
        atomic_write(&direct, "direct.txt", "HELLO WORLD\n", &WriteOptions::default()).await;
        assert_eq!(
            std::fs::read(temp.path().join("out.txt")).unwrap(),
            std::fs::read(&direct).unwrap()
        );
    }

    #[tokio::test]
    async fn test_wrong_chunk_order() {
        let temp = tempdir().unwrap();
        let tool = WriteChunkTool::new();

        tool.execute(
            json!({"path": "out.txt", "content": "a", "chunk_number": 1, "total_chunks": 3}),
            &ctx(&temp),
        )
        .await;

        // Skipping chunk 2
        let result = tool
            .execute(
                json!({"path": "out.txt", "content": "c", "chunk_number": 3, "total_chunks": 3}),
                &ctx(&temp),
            )
            .await;
        let envelope = result.as_json().unwrap();
        assert_eq!(envelope["error"], "wrong_chunk_order");
        assert_eq!(envelope["expected_chunk"], 2);
    }

    #[tokio::test]
    async fn test_chunk_without_start() {
        let temp = tempdir().unwrap();
        let tool = WriteChunkTool::new();

        let result = tool
            .execute(
                json!({"path": "out.txt", "content": "b", "chunk_number": 2, "total_chunks": 2}),
                &ctx(&temp),
            )
            .await;
        assert_eq!(result.as_json().unwrap()["error"], "wrong_chunk_order");
    }

    #[tokio::test]
    async fn test_first_chunk_checksum_mismatch() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("f.txt"), "A").unwrap();
        let tool = WriteChunkTool::new();

        let result = tool
            .execute(
                json!({
                    "path": "f.txt",
                    "content": "B",
                    "chunk_number": 1,
                    "total_chunks": 1,
                    "expected_hash": sha256_hex(b"nope"),
                }),
                &ctx(&temp),
            )
            .await;

        assert_eq!(result.as_json().unwrap()["error"], "checksum_mismatch");
        assert_eq!(std::fs::read_to_string(temp.path().join("f.txt")).unwrap(), "A");
    }

    #[tokio::test]
    async fn test_single_chunk_finalizes_immediately() {
        let temp = tempdir().unwrap();
        let tool = WriteChunkTool::new();

        let result = tool
            .execute(
                json!({"path": "one.txt", "content": "all of it", "chunk_number": 1, "total_chunks": 1}),
                &ctx(&temp),
            )
            .await;

        assert_eq!(result.as_json().unwrap()["complete"], true);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("one.txt")).unwrap(),
            "all of it"
        );
    }

    #[tokio::test]
    async fn test_restart_after_order_error() {
        let temp = tempdir().unwrap();
        let tool = WriteChunkTool::new();
        let c = ctx(&temp);

        tool.execute(
            json!({"path": "f.txt", "content": "a", "chunk_number": 1, "total_chunks": 2}),
            &c,
        )
        .await;
        // Wrong order clears the state
        tool.execute(
            json!({"path": "f.txt", "content": "x", "chunk_number": 3, "total_chunks": 2}),
            &c,
        )
        .await;

        // A fresh chunk-1 starts over cleanly
        tool.execute(
            json!({"path": "f.txt", "content": "1", "chunk_number": 1, "total_chunks": 2}),
            &c,
        )
        .await;
        let result = tool
            .execute(
                json!({"path": "f.txt", "content": "2", "chunk_number": 2, "total_chunks": 2}),
                &c,
            )
            .await;

        assert_eq!(result.as_json().unwrap()["complete"], true);
        assert_eq!(std::fs::read_to_string(temp.path().join("f.txt")).unwrap(), "12");
    }
}
