//! read_file tool

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tools::{Tool, ToolContext, ToolResult};

const DEFAULT_LIMIT: usize = 2000;

/// Read a file, optionally a line window of it
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a file from the work directory. Use offset/limit to window large files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the work directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "0-based first line to return (default: 0)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum lines to return (default: 2000)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(path) = input["path"].as_str() else {
            return ToolResult::error_json(json!({"error": "missing_field", "field": "path"}));
        };

        let target = match ctx.validate_path(Path::new(path)) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "error": "permission_denied",
                    "path": path,
                    "message": e.to_string(),
                }));
            }
        };

        let content = match tokio::fs::read_to_string(&target).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolResult::error_json(json!({"error": "file_not_found", "path": path}));
            }
            Err(e) => {
                return ToolResult::error_json(json!({
                    "error": "io_error",
                    "path": path,
                    "message": e.to_string(),
                }));
            }
        };

        let offset = input["offset"].as_u64().unwrap_or(0) as usize;
        let limit = input["limit"].as_u64().unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let all_lines: Vec<&str> = content.split('\n').collect();
        let total_lines = all_lines.len();
        let window: Vec<&str> = all_lines.into_iter().skip(offset).take(limit).collect();
        let truncated = offset > 0 || offset + window.len() < total_lines;

        ToolResult::success_json(json!({
            "path": path,
            "content": window.join("\n"),
            "lines": window.len(),
            "total_lines": total_lines,
            "truncated": truncated,
        }))
    }
}
