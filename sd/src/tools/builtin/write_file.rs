//! write_file tool - atomic file write
//!
//! Write-to-temp, verify by read-back, backup, rename. Either the old or the
//! new content is visible at every instant; a checksum preflight catches
//! writes based on a stale read of the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::tools::{Tool, ToolContext, ToolResult};

/// Hard cap on a single write
pub const MAX_WRITE_BYTES: usize = 10 * 1024 * 1024;

/// Above this size the envelope carries a chunked-write advisory
pub const CHUNK_ADVISORY_BYTES: usize = 6 * 1024;

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Newline-delimited line count, counting a trailing newline's empty tail
pub(crate) fn line_count(content: &str) -> usize {
    content.split('\n').count()
}

/// Options for an atomic write
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteOptions {
    pub expected_hash: Option<String>,
    pub create_intermediate_dirs: bool,
    pub backup: bool,
}

/// Perform the atomic write against an already-validated absolute path
///
/// `display_path` is echoed in envelopes so the caller sees the path it sent.
pub(crate) async fn atomic_write(
    target: &Path,
    display_path: &str,
    content: &str,
    opts: &WriteOptions,
) -> ToolResult {
    if content.len() > MAX_WRITE_BYTES {
        return ToolResult::error_json(json!({
            "wrote": false,
            "error": "content_too_large",
            "path": display_path,
            "size_bytes": content.len(),
            "max_bytes": MAX_WRITE_BYTES,
        }));
    }

    // Checksum preflight against the current content
    let previous = match tokio::fs::read(target).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return ToolResult::error_json(json!({
                "wrote": false,
                "error": "io_error",
                "path": display_path,
                "message": e.to_string(),
            }));
        }
    };
    let previous_hash = previous.as_deref().map(sha256_hex);

    if let (Some(expected), Some(actual)) = (opts.expected_hash.as_deref(), previous_hash.as_deref())
        && expected != actual
    {
        return ToolResult::error_json(json!({
            "wrote": false,
            "error": "checksum_mismatch",
            "path": display_path,
            "expected_sha256": expected,
            "actual_sha256": actual,
        }));
    }

    if let Some(parent) = target.parent()
        && !parent.exists()
    {
        if opts.create_intermediate_dirs {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error_json(json!({
                    "wrote": false,
                    "error": "io_error",
                    "path": display_path,
                    "message": format!("failed to create directories: {e}"),
                }));
            }
        } else {
            return ToolResult::error_json(json!({
                "wrote": false,
                "error": "directory_not_found",
                "path": display_path,
                "directory": parent.display().to_string(),
            }));
        }
    }

    // Unique sibling temp file, verified by read-back
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let temp_path = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::now_v7()));

    if let Err(e) = tokio::fs::write(&temp_path, content).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return ToolResult::error_json(json!({
            "wrote": false,
            "error": "io_error",
            "path": display_path,
            "message": e.to_string(),
        }));
    }

    match tokio::fs::read(&temp_path).await {
        Ok(bytes) if bytes == content.as_bytes() => {}
        _ => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return ToolResult::error_json(json!({
                "wrote": false,
                "error": "write_failed",
                "path": display_path,
                "message": "temp file verification failed",
            }));
        }
    }

    // Backup, then swap the temp file into place
    let mut backup_path: Option<PathBuf> = None;
    if previous.is_some() && opts.backup {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let candidate = target.with_file_name(format!("{}.bak-{}", file_name, stamp));
        if let Err(e) = tokio::fs::copy(target, &candidate).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return ToolResult::error_json(json!({
                "wrote": false,
                "error": "io_error",
                "path": display_path,
                "message": format!("failed to create backup: {e}"),
            }));
        }
        backup_path = Some(candidate);
    }

    let swap = async {
        if previous.is_some() {
            tokio::fs::remove_file(target).await?;
        }
        tokio::fs::rename(&temp_path, target).await
    };

    if let Err(e) = swap.await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        if let Some(backup) = &backup_path {
            return match tokio::fs::copy(backup, target).await {
                Ok(_) => ToolResult::error_json(json!({
                    "wrote": false,
                    "error": "write_failed_restored",
                    "path": display_path,
                    "message": e.to_string(),
                    "backup_path": backup.display().to_string(),
                })),
                Err(restore_err) => {
                    warn!(path = %display_path, error = %restore_err, "Backup restore failed");
                    ToolResult::error_json(json!({
                        "wrote": false,
                        "error": "write_failed_restore_failed",
                        "path": display_path,
                        "message": e.to_string(),
                        "restore_error": restore_err.to_string(),
                        "backup_path": backup.display().to_string(),
                    }))
                }
            };
        }
        return ToolResult::error_json(json!({
            "wrote": false,
            "error": "write_failed",
            "path": display_path,
            "message": e.to_string(),
        }));
    }

    debug!(path = %display_path, bytes = content.len(), "File written atomically");

    let mut envelope = json!({
        "wrote": true,
        "path": display_path,
        "sha256": sha256_hex(content.as_bytes()),
        "size_bytes": content.len(),
        "lines": line_count(content),
    });
    if let Some(prev) = previous_hash {
        envelope["previous_sha256"] = json!(prev);
    }
    if let Some(backup) = backup_path {
        envelope["backup_path"] = json!(backup.display().to_string());
    }
    if content.len() > CHUNK_ADVISORY_BYTES {
        envelope["warning"] = json!(format!(
            "content is {} bytes; chunked write is recommended above {} bytes",
            content.len(),
            CHUNK_ADVISORY_BYTES
        ));
    }

    ToolResult::success_json(envelope)
}

/// Atomically write a file within the work directory
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Atomically write a file. Pass expected_hash (sha256 of the content you last read) \
         to guard against overwriting concurrent changes."
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
                    "description": "Full file content"
                },
                "expected_hash": {
                    "type": "string",
                    "description": "sha256 the current file must match, if it exists"
                },
                "create_intermediate_dirs": {
                    "type": "boolean",
                    "description": "Create missing parent directories (default: false)"
                },
                "backup": {
                    "type": "boolean",
                    "description": "Keep a timestamped backup of the old content (default: true)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(path) = input["path"].as_str() else {
            return ToolResult::error_json(json!({"wrote": false, "error": "missing_field", "field": "path"}));
        };
        let Some(content) = input["content"].as_str() else {
            return ToolResult::error_json(json!({"wrote": false, "error": "missing_field", "field": "content"}));
        };

        let target = match ctx.validate_path(Path::new(path)) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "wrote": false,
                    "error": "permission_denied",
                    "path": path,
                    "message": e.to_string(),
                }));
            }
        };

        let opts = WriteOptions {
            expected_hash: input["expected_hash"].as_str().map(str::to_string),
            create_intermediate_dirs: input["create_intermediate_dirs"].as_bool().unwrap_or(false),
            backup: input["backup"].as_bool().unwrap_or(true),
        };

        let result = atomic_write(&target, path, content, &opts).await;
        if !result.is_error {
            ctx.schedule_reindex(&target);
        }
        result
    }
}
