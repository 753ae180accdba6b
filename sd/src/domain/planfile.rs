//! Plan-file persistence
//!
//! The plan file is the external JSON contract: readers may watch it while
//! the orchestrator runs. Writes take an advisory lock on a sidecar, write a
//! sibling temp file, and rename over the target so readers never observe a
//! torn document. Transient write errors are retried with bounded backoff.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use super::plan::TaskPlan;

const SAVE_ATTEMPTS: u32 = 4;
const SAVE_BASE_DELAY_MS: u64 = 100;

fn lock_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    std::path::PathBuf::from(os)
}

/// Load and validate a plan file
pub fn load_plan(path: &Path) -> Result<TaskPlan> {
    let content = std::fs::read_to_string(path).context(format!("Failed to read plan file {}", path.display()))?;
    let plan: TaskPlan = serde_json::from_str(&content).context("Failed to parse plan file")?;
    plan.validate().context("Plan file failed validation")?;
    Ok(plan)
}

/// Write a plan file atomically under the sidecar lock
pub fn save_plan(plan: &TaskPlan, path: &Path) -> Result<()> {
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))
        .context("Failed to open plan lock file")?;
    lock_file.lock_exclusive().context("Failed to lock plan file")?;

    let result = write_locked(plan, path);

    // Unlock errors are secondary to the write outcome
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

fn write_locked(plan: &TaskPlan, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(plan).context("Failed to serialize plan")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content).context("Failed to write plan temp file")?;
    std::fs::rename(&tmp, path).context("Failed to move plan file into place")?;

    debug!(path = %path.display(), plan_id = %plan.id, "Plan persisted");
    Ok(())
}

/// Save with bounded exponential backoff on transient errors
///
/// Only unrecoverable persistence failures propagate; they are fatal to the
/// orchestration.
pub async fn save_plan_with_retry(plan: &TaskPlan, path: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=SAVE_ATTEMPTS {
        match save_plan(plan, path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "Plan save failed, retrying");
                last_err = Some(e);
                if attempt < SAVE_ATTEMPTS {
                    let delay = SAVE_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}
