//! Process-isolated agents
//!
//! Each isolated agent is a child process of the same executable running in
//! agent mode. The IPC is line-delimited JSON over stdin/stdout with a
//! one-command/one-response framing; the child announces readiness with a
//! single well-known line before accepting commands. A command timeout kills
//! the child's whole process group and fails the task.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use eyre::{Context, Result, bail, eyre};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

use crate::agent::{AgentLoop, AgentTaskResult, PriorTaskSummary};
use crate::domain::SubTask;
use crate::tools::ToolContext;

/// Line the child prints before accepting commands
pub const READY_LINE: &str = "SWARMD_AGENT_READY";

/// Environment variables set on every orchestrated child
pub const ENV_AGENT_ID: &str = "SWARMD_AGENT_ID";
pub const ENV_ORCHESTRATED: &str = "SWARMD_ORCHESTRATED";

/// One command sent to an agent child
///
/// Carries the subtask plus enough plan context for the child to reason:
/// the original request and the results of prior subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    pub subtask: SubTask,
    pub original_request: String,
    pub prior_results: Vec<PriorTaskSummary>,
}

/// Handle to a spawned agent child process
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl AgentProcess {
    /// Spawn an agent child and wait for its ready-line
    ///
    /// Absence of the ready-line within `startup_timeout` is a start failure.
    pub async fn spawn(
        program: &Path,
        agent_id: &str,
        work_dir: &Path,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let mut command = tokio::process::Command::new(program);
        command
            .arg("agent")
            .arg("--agent-id")
            .arg(agent_id)
            .arg("--work-dir")
            .arg(work_dir)
            .env(ENV_AGENT_ID, agent_id)
            .env(ENV_ORCHESTRATED, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().context("Failed to spawn agent process")?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let mut lines = BufReader::new(stdout).lines();

        // Handshake: wait for the ready-line
        let handshake = async {
            while let Some(line) = lines.next_line().await? {
                if line.trim() == READY_LINE {
                    return Ok::<_, std::io::Error>(true);
                }
                debug!(agent_id, line = %line, "Pre-ready output from agent child");
            }
            Ok(false)
        };

        match tokio::time::timeout(startup_timeout, handshake).await {
            Ok(Ok(true)) => {
                info!(agent_id, pid, "Agent process ready");
            }
            Ok(Ok(false)) => {
                kill_child_group(pid);
                bail!("agent child exited before announcing readiness");
            }
            Ok(Err(e)) => {
                kill_child_group(pid);
                return Err(eyre!("agent child handshake failed: {e}"));
            }
            Err(_) => {
                kill_child_group(pid);
                bail!("agent child did not announce readiness within {startup_timeout:?}");
            }
        }

        Ok(Self {
            child,
            pid,
            stdin,
            stdout: lines,
        })
    }

    /// Send one command and read exactly one response line
    ///
    /// A timeout kills the child's process group and fails the task.
    pub async fn run_task(&mut self, command: &AgentCommand, timeout: Duration) -> Result<AgentTaskResult> {
        let mut line = serde_json::to_string(command).context("Failed to serialize agent command")?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to write command to agent child")?;
        self.stdin.flush().await.context("Failed to flush agent stdin")?;

        let response = match tokio::time::timeout(timeout, self.stdout.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                kill_child_group(self.pid);
                bail!("agent child closed its output mid-task");
            }
            Ok(Err(e)) => {
                kill_child_group(self.pid);
                return Err(eyre!("failed to read agent response: {e}"));
            }
            Err(_) => {
                warn!(pid = self.pid, "Agent command timed out; killing process group");
                kill_child_group(self.pid);
                bail!("agent command timed out after {timeout:?}");
            }
        };

        serde_json::from_str(&response).context("Agent child returned malformed result JSON")
    }

    /// Close stdin and wait for the child to exit; escalates to a kill
    pub async fn shutdown(mut self) {
        drop(self.stdin);
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                kill_child_group(self.pid);
                let _ = self.child.wait().await;
            }
        }
    }
}

fn kill_child_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if pid != 0
        && let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
    {
        debug!(pid, error = %e, "killpg failed (child may have exited)");
    }
}

/// Child-side serving loop for `sd agent` mode
///
/// Prints the ready-line, then answers one JSON command per input line with
/// one JSON result line until stdin closes.
pub async fn serve_agent_mode(engine: &AgentLoop, agent_id: &str, work_dir: &Path) -> Result<()> {
    use std::io::Write;

    // The ready-line must reach the parent before any command arrives
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{READY_LINE}")?;
        stdout.flush()?;
    }

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command: AgentCommand = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Malformed agent command");
                let error = serde_json::json!({"error": "invalid_arguments", "message": e.to_string()});
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{error}")?;
                stdout.flush()?;
                continue;
            }
        };

        let ctx = ToolContext::new(work_dir.to_path_buf(), agent_id.to_string());
        let result = engine
            .run(
                &command.subtask,
                &command.original_request,
                &command.prior_results,
                &ctx,
                None,
            )
            .await;

        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", serde_json::to_string(&result)?)?;
        stdout.flush()?;
    }

    info!(agent_id, "Agent mode input closed; exiting");
    Ok(())
}
