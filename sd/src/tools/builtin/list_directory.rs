//! list_directory tool

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::tools::{Tool, ToolContext, ToolResult};

const MAX_ENTRIES: usize = 500;
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// List directory contents within the work directory
pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List files and directories under a path in the work directory."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: the work directory root)"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum recursion depth (default: 2)"
                }
            }
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let rel = input["path"].as_str().unwrap_or(".");
        let depth = input["depth"].as_u64().unwrap_or(2).clamp(1, 10) as usize;

        let root = match ctx.validate_path(Path::new(rel)) {
            Ok(p) => p,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "error": "permission_denied",
                    "path": rel,
                    "message": e.to_string(),
                }));
            }
        };
        if !root.is_dir() {
            return ToolResult::error_json(json!({"error": "directory_not_found", "path": rel}));
        }

        let mut entries = Vec::new();
        let mut truncated = false;

        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !SKIPPED_DIRS.contains(&n))
                    .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
        {
            if entries.len() >= MAX_ENTRIES {
                truncated = true;
                break;
            }

            let rel_path = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let kind = if entry.file_type().is_dir() { "dir" } else { "file" };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            entries.push(json!({
                "path": rel_path.display().to_string(),
                "kind": kind,
                "size": size,
            }));
        }

        ToolResult::success_json(json!({
            "path": rel,
            "entries": entries,
            "count": entries.len(),
            "truncated": truncated,
        }))
    }
}
