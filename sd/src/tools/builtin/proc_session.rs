//! process tool - background process sessions
//!
//! For long-running programs: start returns a session id, read returns the
//! stdout/stderr delta since the previous read, write feeds stdin, stop kills
//! the process group. The registry is concurrency-safe; add is
//! compare-and-insert and stop_all iterates a snapshot of keys.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::tools::{Tool, ToolContext, ToolResult};

use super::run_command::kill_process_group;

/// Commands background sessions may run (same list as run_command)
const ALLOWED_COMMANDS: &[&str] = &["git", "bash", "sh", "cargo", "make", "python3", "npm"];

const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct OutputBuffer {
    data: String,
    read_pos: usize,
}

impl OutputBuffer {
    /// Take everything appended since the last read
    fn take_delta(&mut self) -> String {
        let delta = self.data[self.read_pos..].to_string();
        self.read_pos = self.data.len();
        delta
    }
}

/// One running background process
pub struct ProcSession {
    pub id: String,
    pid: u32,
    child: TokioMutex<Child>,
    stdin: TokioMutex<Option<ChildStdin>>,
    stdout: Arc<StdMutex<OutputBuffer>>,
    stderr: Arc<StdMutex<OutputBuffer>>,
    started_at: Instant,
}

impl ProcSession {
    fn spawn(id: String, cmd: &str, args: &[String], cwd: &std::path::Path) -> std::io::Result<Self> {
        let mut command = tokio::process::Command::new(cmd);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();

        let stdout = Arc::new(StdMutex::new(OutputBuffer::default()));
        let stderr = Arc::new(StdMutex::new(OutputBuffer::default()));

        if let Some(mut pipe) = child.stdout.take() {
            let buffer = stdout.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    let text = String::from_utf8_lossy(&chunk[..n]).to_string();
                    buffer.lock().unwrap().data.push_str(&text);
                }
            });
        }
        if let Some(mut pipe) = child.stderr.take() {
            let buffer = stderr.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = pipe.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    let text = String::from_utf8_lossy(&chunk[..n]).to_string();
                    buffer.lock().unwrap().data.push_str(&text);
                }
            });
        }

        Ok(Self {
            id,
            pid,
            child: TokioMutex::new(child),
            stdin: TokioMutex::new(stdin),
            stdout,
            stderr,
            started_at: Instant::now(),
        })
    }

    /// Delta of output since the last read, waiting up to `wait_ms` for new data
    async fn read_delta(&self, wait_ms: u64) -> (String, String) {
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        loop {
            let out = self.stdout.lock().unwrap().take_delta();
            let err = self.stderr.lock().unwrap().take_delta();
            if !out.is_empty() || !err.is_empty() || Instant::now() >= deadline {
                return (out, err);
            }
            tokio::time::sleep(READ_POLL_INTERVAL).await;
        }
    }

    async fn write_stdin(&self, input: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(input.as_bytes()).await?;
                stdin.flush().await
            }
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed")),
        }
    }

    /// (running, exit_code)
    async fn status(&self) -> (bool, Option<i32>) {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => (false, status.code()),
            Ok(None) => (true, None),
            Err(_) => (false, None),
        }
    }

    async fn stop(&self, force: bool) -> Option<i32> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if self.pid != 0 {
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), signal) {
                debug!(pid = self.pid, error = %e, "killpg failed (process may have exited)");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(_)) => None,
            Err(_) => {
                // Grace period expired; escalate
                if self.pid != 0 {
                    kill_process_group(self.pid);
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Registry of live background sessions
pub struct ProcessRegistry {
    sessions: StdMutex<HashMap<String, Arc<ProcSession>>>,
    counter: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("proc_{}_{}", n, chrono::Utc::now().timestamp_millis())
    }

    /// Compare-and-insert; false if the id is already taken
    fn insert(&self, session: Arc<ProcSession>) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id.clone(), session);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcSession>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Remove returns the previous session, if any
    pub fn remove(&self, id: &str) -> Option<Arc<ProcSession>> {
        self.sessions.lock().unwrap().remove(id)
    }

    /// Snapshot of live session ids
    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Stop every session; iterates a snapshot so concurrent removals are safe
    pub async fn stop_all(&self) {
        for id in self.ids() {
            if let Some(session) = self.remove(&id) {
                session.stop(true).await;
            }
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Manage long-running background processes
pub struct ProcessSessionTool {
    registry: Arc<ProcessRegistry>,
}

impl ProcessSessionTool {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    fn not_found(id: &str) -> ToolResult {
        ToolResult::error_json(json!({"error": "session_not_found", "session_id": id}))
    }
}

#[async_trait]
impl Tool for ProcessSessionTool {
    fn name(&self) -> &'static str {
        "process"
    }

    fn description(&self) -> &'static str {
        "Manage long-running background processes: start a program, read incremental \
         output, write to stdin, check status, or stop it."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": {
                    "type": "string",
                    "enum": ["start", "read", "write", "status", "stop"],
                    "description": "Operation to perform"
                },
                "cmd": { "type": "string", "description": "Command for op=start" },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Arguments for op=start"
                },
                "cwd": { "type": "string", "description": "Working directory for op=start" },
                "session_id": { "type": "string", "description": "Session id for read/write/status/stop" },
                "wait_ms": { "type": "integer", "description": "How long read waits for new output" },
                "input": { "type": "string", "description": "Text to write to stdin" },
                "force": { "type": "boolean", "description": "SIGKILL instead of SIGTERM on stop" }
            },
            "required": ["op"]
        })
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(op) = input["op"].as_str() else {
            return ToolResult::error_json(json!({"error": "missing_field", "field": "op"}));
        };

        match op {
            "start" => {
                let Some(cmd) = input["cmd"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "cmd"}));
                };
                if !ALLOWED_COMMANDS.contains(&cmd) {
                    warn!(cmd, "Background command not on allow-list");
                    return ToolResult::error_json(json!({
                        "started": false,
                        "error": "command_not_allowed",
                    }));
                }

                let args: Vec<String> = input["args"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();

                let cwd = match input["cwd"].as_str() {
                    Some(dir) => match ctx.validate_path(std::path::Path::new(dir)) {
                        Ok(p) => p,
                        Err(e) => {
                            return ToolResult::error_json(json!({
                                "started": false,
                                "error": "permission_denied",
                                "message": e.to_string(),
                            }));
                        }
                    },
                    None => ctx.work_dir.clone(),
                };

                let id = self.registry.next_id();
                let session = match ProcSession::spawn(id.clone(), cmd, &args, &cwd) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        return ToolResult::error_json(json!({
                            "started": false,
                            "error": "io_error",
                            "message": format!("spawn failed: {e}"),
                        }));
                    }
                };

                if !self.registry.insert(session.clone()) {
                    // Counter ids never collide in practice; treat as fatal
                    session.stop(true).await;
                    return ToolResult::error_json(json!({
                        "started": false,
                        "error": "io_error",
                        "message": "session id collision",
                    }));
                }

                debug!(session_id = %id, cmd, "Background session started");
                ToolResult::success_json(json!({"started": true, "session_id": id}))
            }

            "read" => {
                let Some(id) = input["session_id"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "session_id"}));
                };
                let Some(session) = self.registry.get(id) else {
                    return Self::not_found(id);
                };

                let wait_ms = input["wait_ms"].as_u64().unwrap_or(0).min(30_000);
                let (stdout, stderr) = session.read_delta(wait_ms).await;
                let (running, exit_code) = session.status().await;

                ToolResult::success_json(json!({
                    "session_id": id,
                    "stdout": stdout,
                    "stderr": stderr,
                    "running": running,
                    "exit_code": exit_code,
                }))
            }

            "write" => {
                let Some(id) = input["session_id"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "session_id"}));
                };
                let Some(text) = input["input"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "input"}));
                };
                let Some(session) = self.registry.get(id) else {
                    return Self::not_found(id);
                };

                match session.write_stdin(text).await {
                    Ok(()) => ToolResult::success_json(json!({"session_id": id, "written": true})),
                    Err(e) => ToolResult::error_json(json!({
                        "session_id": id,
                        "written": false,
                        "error": "io_error",
                        "message": e.to_string(),
                    })),
                }
            }

            "status" => {
                let Some(id) = input["session_id"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "session_id"}));
                };
                let Some(session) = self.registry.get(id) else {
                    return Self::not_found(id);
                };

                let (running, exit_code) = session.status().await;
                ToolResult::success_json(json!({
                    "session_id": id,
                    "running": running,
                    "exit_code": exit_code,
                    "uptime_ms": session.uptime().as_millis() as u64,
                }))
            }

            "stop" => {
                let Some(id) = input["session_id"].as_str() else {
                    return ToolResult::error_json(json!({"error": "missing_field", "field": "session_id"}));
                };
                let Some(session) = self.registry.remove(id) else {
                    return Self::not_found(id);
                };

                let force = input["force"].as_bool().unwrap_or(false);
                let exit_code = session.stop(force).await;
                ToolResult::success_json(json!({
                    "session_id": id,
                    "stopped": true,
                    "exit_code": exit_code,
                }))
            }

            other => ToolResult::error_json(json!({
                "error": "invalid_arguments",
                "message": format!("unknown op: {other}"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(temp: &tempfile::TempDir) -> (ProcessSessionTool, ToolContext) {
        let registry = Arc::new(ProcessRegistry::new());
        (
            ProcessSessionTool::new(registry),
            ToolContext::new(temp.path().to_path_buf(), "test".to_string()),
        )
    }

    async fn start(tool: &ProcessSessionTool, ctx: &ToolContext, script: &str) -> String {
        let result = tool
            .execute(json!({"op": "start", "cmd": "sh", "args": ["-c", script]}), ctx)
            .await;
        assert!(!result.is_error, "{}", result.content);
        result.as_json().unwrap()["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_start_read_stop() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let id = start(&tool, &ctx, "echo ready; sleep 20").await;
        assert!(id.starts_with("proc_"));

        let result = tool
            .execute(json!({"op": "read", "session_id": id, "wait_ms": 2000}), &ctx)
            .await;
        let envelope = result.as_json().unwrap();
        assert!(envelope["stdout"].as_str().unwrap().contains("ready"));
        assert_eq!(envelope["running"], true);

        let result = tool
            .execute(json!({"op": "stop", "session_id": id, "force": true}), &ctx)
            .await;
        assert_eq!(result.as_json().unwrap()["stopped"], true);

        // Stopped sessions are gone from the registry
        let result = tool.execute(json!({"op": "status", "session_id": id}), &ctx).await;
        assert_eq!(result.as_json().unwrap()["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_read_returns_delta_only() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let id = start(&tool, &ctx, "echo one; sleep 20").await;

        let first = tool
            .execute(json!({"op": "read", "session_id": id, "wait_ms": 2000}), &ctx)
            .await;
        assert!(first.as_json().unwrap()["stdout"].as_str().unwrap().contains("one"));

        // Nothing new since the last read
        let second = tool.execute(json!({"op": "read", "session_id": id}), &ctx).await;
        assert_eq!(second.as_json().unwrap()["stdout"], "");

        tool.execute(json!({"op": "stop", "session_id": id, "force": true}), &ctx)
            .await;
    }

    #[tokio::test]
    async fn test_write_stdin() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let id = start(&tool, &ctx, "read line; echo got:$line").await;

        let result = tool
            .execute(json!({"op": "write", "session_id": id, "input": "ping\n"}), &ctx)
            .await;
        assert_eq!(result.as_json().unwrap()["written"], true);

        let result = tool
            .execute(json!({"op": "read", "session_id": id, "wait_ms": 3000}), &ctx)
            .await;
        assert!(result.as_json().unwrap()["stdout"].as_str().unwrap().contains("got:ping"));
    }

    #[tokio::test]
    async fn test_status_reports_exit() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let id = start(&tool, &ctx, "exit 7").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = tool.execute(json!({"op": "status", "session_id": id}), &ctx).await;
        let envelope = result.as_json().unwrap();
        assert_eq!(envelope["running"], false);
        assert_eq!(envelope["exit_code"], 7);
    }

    #[tokio::test]
    async fn test_start_rejects_unlisted_command() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let result = tool.execute(json!({"op": "start", "cmd": "rm"}), &ctx).await;
        assert_eq!(result.as_json().unwrap()["error"], "command_not_allowed");
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let temp = tempdir().unwrap();
        let registry = Arc::new(ProcessRegistry::new());
        let tool = ProcessSessionTool::new(registry.clone());
        let ctx = ToolContext::new(temp.path().to_path_buf(), "test".to_string());

        start(&tool, &ctx, "sleep 20").await;
        start(&tool, &ctx, "sleep 20").await;
        assert_eq!(registry.ids().len(), 2);

        registry.stop_all().await;
        assert!(registry.ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let temp = tempdir().unwrap();
        let (tool, ctx) = setup(&temp);

        let result = tool.execute(json!({"op": "read", "session_id": "proc_99_0"}), &ctx).await;
        assert_eq!(result.as_json().unwrap()["error"], "session_not_found");
    }
}
