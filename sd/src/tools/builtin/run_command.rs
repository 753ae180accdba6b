//! run_command tool - whitelisted process execution
//!
//! Unknown commands never reach the OS: the allow-list is checked before any
//! spawn and violations come back as a structured result. Timeout and
//! cancellation both kill the entire process group; partial output is
//! returned regardless.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::tools::{Tool, ToolContext, ToolResult};

/// Commands agents may execute
const ALLOWED_COMMANDS: &[&str] = &["git", "bash", "sh", "cargo", "make", "python3", "npm"];

/// Shells whose single-string form is wrapped into `-c`
const SHELLS: &[&str] = &["bash", "sh"];

const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_OUTPUT_CHARS: usize = 30_000;

/// SIGKILL the whole process group
pub(crate) fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed (process may have exited)");
    }
}

fn truncate_output(s: String) -> String {
    if s.len() <= MAX_OUTPUT_CHARS {
        return s;
    }
    let mut end = MAX_OUTPUT_CHARS;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated, {} chars total]", &s[..end], s.len())
}

/// Execute a whitelisted command in the work directory
pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a whitelisted command (git, bash, sh, cargo, make, python3, npm) in the \
         work directory and return exit code, stdout, and stderr."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Command name, must be on the allow-list"
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Command arguments"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory, relative to the agent work directory"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds, clamped to 1s..10min (default: 120000)"
                }
            },
            "required": ["cmd"]
        })
    }

    /// The tool manages its own deadline so partial output survives
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(cmd) = input["cmd"].as_str() else {
            return ToolResult::error_json(json!({"error": "missing_field", "field": "cmd"}));
        };

        let mut args: Vec<String> = input["args"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if !ALLOWED_COMMANDS.contains(&cmd) {
            warn!(cmd, "Command not on allow-list");
            return ToolResult::error_json(json!({
                "exit_code": -1,
                "stdout": "",
                "stderr": "command_not_allowed",
            }));
        }

        // Wrap a bare command string so the shell exits cleanly
        if SHELLS.contains(&cmd) && args.len() == 1 && !args[0].starts_with('-') {
            args = vec!["-c".to_string(), args.remove(0)];
        }

        let cwd = match input["cwd"].as_str() {
            Some(dir) => match ctx.validate_path(Path::new(dir)) {
                Ok(p) => p,
                Err(e) => {
                    return ToolResult::error_json(json!({
                        "exit_code": -1,
                        "stdout": "",
                        "stderr": format!("invalid cwd: {e}"),
                    }));
                }
            },
            None => ctx.work_dir.clone(),
        };

        let timeout_ms = input["timeout_ms"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);

        let mut command = tokio::process::Command::new(cmd);
        command
            .args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::error_json(json!({
                    "exit_code": -1,
                    "stdout": "",
                    "stderr": format!("spawn failed: {e}"),
                }));
            }
        };

        let pid = child.id().unwrap_or(0);

        // Drain pipes concurrently so a killed process still yields partial output
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut cancel = ctx.cancel.clone();
        let mut timed_out = false;
        let mut cancelled = false;

        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                timed_out = true;
                if pid != 0 {
                    kill_process_group(pid);
                }
                child.wait().await.ok()
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                if pid != 0 {
                    kill_process_group(pid);
                }
                child.wait().await.ok()
            }
        };

        let stdout = truncate_output(String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string());
        let stderr = truncate_output(String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string());
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);

        debug!(cmd, exit_code, timed_out, cancelled, "Command finished");

        let envelope = json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "timed_out": timed_out,
            "cancelled": cancelled,
        });

        if exit_code == 0 && !timed_out && !cancelled {
            ToolResult::success_json(envelope)
        } else {
            ToolResult::error_json(envelope)
        }
    }
}
