//! apply_patch tool - unified-diff application with diagnostic feedback
//!
//! On a hunk mismatch the envelope carries the target file's actual content
//! around the failing hunk (1-based line numbers) so the model can regenerate
//! a corrected patch instead of guessing.

use std::path::Path;

use async_trait::async_trait;
use diffy::Patch;
use serde_json::{Value, json};
use tracing::debug;

use crate::tools::{Tool, ToolContext, ToolResult};

use super::write_file::{WriteOptions, atomic_write, line_count, sha256_hex};

const DIAGNOSTIC_CONTEXT_LINES: usize = 10;
const MAX_DIAGNOSTIC_HUNKS: usize = 3;

/// Strip the conventional a/ and b/ prefixes from patch header paths
fn strip_git_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Content windows around each hunk of a failing patch
fn hunk_diagnostics(file_content: &str, patch: &Patch<'_, str>) -> Vec<Value> {
    let lines: Vec<&str> = file_content.split('\n').collect();

    patch
        .hunks()
        .iter()
        .take(MAX_DIAGNOSTIC_HUNKS)
        .map(|hunk| {
            let old = hunk.old_range();
            let new = hunk.new_range();

            let start = old.start().saturating_sub(1);
            let window_start = start.saturating_sub(DIAGNOSTIC_CONTEXT_LINES);
            let window_end = (start + old.len() + DIAGNOSTIC_CONTEXT_LINES).min(lines.len());

            let window = (window_start..window_end)
                .map(|i| format!("{:>5} | {}", i + 1, lines[i]))
                .collect::<Vec<_>>()
                .join("\n");

            json!({
                "hunk": format!("@@ -{},{} +{},{} @@", old.start(), old.len(), new.start(), new.len()),
                "file_window": window,
            })
        })
        .collect()
}

/// Apply a unified diff within the work directory
pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    fn description(&self) -> &'static str {
        "Apply a unified diff to one file. On a hunk mismatch the result includes the \
         file's actual content around the failing hunk so you can regenerate the patch."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "Unified diff with ---/+++ headers and @@ hunks"
                },
                "path": {
                    "type": "string",
                    "description": "Target file; defaults to the path in the patch headers"
                }
            },
            "required": ["patch"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(patch_text) = input["patch"].as_str() else {
            return ToolResult::error_json(json!({"applied": false, "error": "missing_field", "field": "patch"}));
        };

        let has_headers =
            patch_text.lines().any(|l| l.starts_with("--- ")) && patch_text.lines().any(|l| l.starts_with("+++ "));
        if patch_text.trim().is_empty() || !has_headers {
            return ToolResult::error_json(json!({
                "applied": false,
                "error": "invalid_patch_format",
                "message": "patch must contain ---/+++ headers",
            }));
        }

        let patch = match Patch::from_str(patch_text) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "applied": false,
                    "error": "invalid_patch_format",
                    "message": e.to_string(),
                }));
            }
        };

        // Explicit path argument wins over the headers
        let header_path = patch
            .modified()
            .filter(|p| *p != "/dev/null")
            .or_else(|| patch.original().filter(|p| *p != "/dev/null"))
            .map(strip_git_prefix)
            .map(str::to_string);
        let Some(rel_path) = input["path"].as_str().map(str::to_string).or(header_path) else {
            return ToolResult::error_json(json!({
                "applied": false,
                "error": "invalid_patch_format",
                "message": "patch names no target file and no path was given",
            }));
        };

        let target = match ctx.validate_path(Path::new(&rel_path)) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "applied": false,
                    "error": "permission_denied",
                    "path": rel_path,
                    "message": e.to_string(),
                }));
            }
        };

        let creates_file = patch.original().map(|o| o == "/dev/null").unwrap_or(false);
        let base = if creates_file {
            String::new()
        } else {
            match tokio::fs::read_to_string(&target).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return ToolResult::error_json(json!({
                        "applied": false,
                        "error": "file_not_found",
                        "path": rel_path,
                    }));
                }
                Err(e) => {
                    return ToolResult::error_json(json!({
                        "applied": false,
                        "error": "io_error",
                        "path": rel_path,
                        "message": e.to_string(),
                    }));
                }
            }
        };

        match diffy::apply(&base, &patch) {
            Ok(patched) => {
                let opts = WriteOptions {
                    expected_hash: None,
                    create_intermediate_dirs: creates_file,
                    backup: !creates_file,
                };
                let write_result = atomic_write(&target, &rel_path, &patched, &opts).await;
                if write_result.is_error {
                    return write_result;
                }

                ctx.schedule_reindex(&target);
                debug!(path = %rel_path, "Patch applied");
                ToolResult::success_json(json!({
                    "applied": true,
                    "path": rel_path,
                    "lines": line_count(&patched),
                    "sha256": sha256_hex(patched.as_bytes()),
                }))
            }
            Err(e) => ToolResult::error_json(json!({
                "applied": false,
                "error": "hunk_mismatch",
                "path": rel_path,
                "message": e.to_string(),
                "diagnostics": hunk_diagnostics(&base, &patch),
            })),
        }
    }
}
