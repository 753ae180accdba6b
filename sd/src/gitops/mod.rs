//! Git repository and branch operations
//!
//! Everything the orchestrator needs from version control: repo bootstrap,
//! the orchestration branch per plan, a working branch per agent, and the
//! no-fast-forward merge that folds each agent branch back with one merge
//! commit, preserving per-agent authorship.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Git command failed: {0}")]
    CommandFailed(String),

    #[error("Not a git repository: {0}")]
    NotARepo(String),

    #[error("Branch operation failed: {0}")]
    BranchFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of merging one agent branch
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Merged with a merge commit
    Merged,
    /// Merge conflicts; the merge was aborted
    Conflict { message: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged)
    }
}

/// Run a git command and return trimmed stdout
async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git").args(args).current_dir(dir).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!("git {}: {}", args.join(" "), stderr.trim())));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check whether a directory is inside a git work tree
pub async fn is_repo(dir: &Path) -> bool {
    run_git(dir, &["rev-parse", "--is-inside-work-tree"])
        .await
        .map(|out| out == "true")
        .unwrap_or(false)
}

/// Ensure `dir` is a git repository with at least one commit
///
/// Initializes a fresh repository with an initial commit when none exists.
pub async fn ensure_repo(dir: &Path) -> Result<(), GitError> {
    if !is_repo(dir).await {
        info!(dir = %dir.display(), "Initializing git repository");
        run_git(dir, &["init"]).await?;
        run_git(dir, &["config", "user.email", "swarmd@localhost"]).await?;
        run_git(dir, &["config", "user.name", "swarmd"]).await?;
    }

    // A repo without commits cannot branch
    if run_git(dir, &["rev-parse", "HEAD"]).await.is_err() {
        run_git(dir, &["add", "-A"]).await?;
        run_git(dir, &["commit", "--allow-empty", "-m", "Initial commit"]).await?;
    }

    Ok(())
}

pub async fn current_branch(dir: &Path) -> Result<String, GitError> {
    run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

pub async fn branch_exists(dir: &Path, name: &str) -> bool {
    run_git(dir, &["rev-parse", "--verify", &format!("refs/heads/{name}")])
        .await
        .is_ok()
}

/// Create a branch off `base` (or HEAD) and check it out
pub async fn create_branch(dir: &Path, name: &str, base: Option<&str>) -> Result<(), GitError> {
    let mut args = vec!["checkout", "-b", name];
    if let Some(base) = base {
        args.push(base);
    }
    run_git(dir, &args)
        .await
        .map_err(|e| GitError::BranchFailed(e.to_string()))?;
    debug!(branch = name, "Branch created");
    Ok(())
}

pub async fn checkout(dir: &Path, name: &str) -> Result<(), GitError> {
    run_git(dir, &["checkout", name])
        .await
        .map_err(|e| GitError::BranchFailed(e.to_string()))?;
    Ok(())
}

/// Stage and commit everything; quietly does nothing on a clean tree
pub async fn commit_all(dir: &Path, message: &str) -> Result<(), GitError> {
    let status = run_git(dir, &["status", "--porcelain"]).await?;
    if status.is_empty() {
        debug!("Nothing to commit");
        return Ok(());
    }

    run_git(dir, &["add", "-A"]).await?;
    run_git(dir, &["commit", "-m", message]).await?;
    Ok(())
}

/// Merge `branch` into the current branch with a merge commit
///
/// Always `--no-ff` so every agent branch leaves exactly one merge commit.
/// Conflicts abort the merge and are reported, never left in the tree.
pub async fn merge_branch(dir: &Path, branch: &str, message: &str) -> Result<MergeOutcome, GitError> {
    let result = run_git(dir, &["merge", "--no-ff", branch, "-m", message]).await;

    match result {
        Ok(_) => {
            info!(branch, "Branch merged");
            Ok(MergeOutcome::Merged)
        }
        Err(GitError::CommandFailed(stderr)) => {
            warn!(branch, "Merge conflict; aborting merge");
            let _ = run_git(dir, &["merge", "--abort"]).await;
            Ok(MergeOutcome::Conflict { message: stderr })
        }
        Err(e) => Err(e),
    }
}

/// Delete a branch, ignoring failures for missing branches
pub async fn delete_branch(dir: &Path, name: &str) {
    if let Err(e) = run_git(dir, &["branch", "-D", name]).await {
        debug!(branch = name, error = %e, "Branch deletion skipped");
    }
}

/// Add a worktree on a (force-reset) branch off `base`
///
/// Worktrees give each agent an exclusive checkout of its own branch while
/// the root stays on the orchestration branch.
pub async fn add_worktree(repo: &Path, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let path_str = path.to_str().ok_or_else(|| GitError::BranchFailed("non-utf8 worktree path".to_string()))?;
    run_git(repo, &["worktree", "add", path_str, "-B", branch, base]).await?;
    debug!(path = %path.display(), branch, "Worktree added");
    Ok(())
}

/// Remove a worktree; tolerates one that is already gone
pub async fn remove_worktree(repo: &Path, path: &Path) -> Result<(), GitError> {
    let path_str = path.to_str().ok_or_else(|| GitError::BranchFailed("non-utf8 worktree path".to_string()))?;
    match run_git(repo, &["worktree", "remove", path_str, "--force"]).await {
        Ok(_) => Ok(()),
        Err(GitError::CommandFailed(msg)) if msg.contains("is not a working tree") => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn write_and_commit(dir: &Path, file: &str, content: &str, message: &str) {
        tokio::fs::write(dir.join(file), content).await.unwrap();
        commit_all(dir, message).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_repo_initializes() {
        let temp = tempdir().unwrap();

        assert!(!is_repo(temp.path()).await);
        ensure_repo(temp.path()).await.unwrap();
        assert!(is_repo(temp.path()).await);

        // HEAD exists, so branching works immediately
        assert!(run_git(temp.path(), &["rev-parse", "HEAD"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_repo_idempotent() {
        let temp = tempdir().unwrap();
        ensure_repo(temp.path()).await.unwrap();
        ensure_repo(temp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_branch_create_and_checkout() {
        let temp = tempdir().unwrap();
        ensure_repo(temp.path()).await.unwrap();
        let main = current_branch(temp.path()).await.unwrap();

        create_branch(temp.path(), "orchestration/test-plan", None).await.unwrap();
        assert_eq!(current_branch(temp.path()).await.unwrap(), "orchestration/test-plan");
        assert!(branch_exists(temp.path(), "orchestration/test-plan").await);

        checkout(temp.path(), &main).await.unwrap();
        assert_eq!(current_branch(temp.path()).await.unwrap(), main);
    }

    #[tokio::test]
    async fn test_merge_no_ff_creates_merge_commit() {
        let temp = tempdir().unwrap();
        let dir = temp.path();
        ensure_repo(dir).await.unwrap();
        let base = current_branch(dir).await.unwrap();

        create_branch(dir, "agent/p/a1/t1", None).await.unwrap();
        write_and_commit(dir, "agent.txt", "agent work\n", "agent: do work").await;

        checkout(dir, &base).await.unwrap();
        let outcome = merge_branch(dir, "agent/p/a1/t1", "Merge subtask t1").await.unwrap();
        assert!(outcome.is_merged());

        // --no-ff leaves a merge commit with two parents
        let parents = run_git(dir, &["rev-list", "--parents", "-n", "1", "HEAD"]).await.unwrap();
        assert_eq!(parents.split_whitespace().count(), 3);
        assert!(dir.join("agent.txt").exists());
    }

    #[tokio::test]
    async fn test_merge_conflict_aborts_cleanly() {
        let temp = tempdir().unwrap();
        let dir = temp.path();
        ensure_repo(dir).await.unwrap();
        let base = current_branch(dir).await.unwrap();
        write_and_commit(dir, "f.txt", "base\n", "base content").await;

        create_branch(dir, "agent/p/a1/t1", None).await.unwrap();
        write_and_commit(dir, "f.txt", "agent version\n", "agent change").await;

        checkout(dir, &base).await.unwrap();
        write_and_commit(dir, "f.txt", "main version\n", "main change").await;

        let outcome = merge_branch(dir, "agent/p/a1/t1", "Merge t1").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));

        // Tree is clean after the abort
        let status = run_git(dir, &["status", "--porcelain"]).await.unwrap();
        assert!(status.is_empty());
        assert_eq!(
            tokio::fs::read_to_string(dir.join("f.txt")).await.unwrap(),
            "main version\n"
        );
    }

    #[tokio::test]
    async fn test_worktree_add_and_remove() {
        let temp = tempdir().unwrap();
        let dir = temp.path();
        ensure_repo(dir).await.unwrap();

        let worktree = dir.join("agents/agent-001/t1");
        add_worktree(dir, &worktree, "agent/p/agent-001/t1", "HEAD").await.unwrap();
        assert!(worktree.exists());
        assert_eq!(current_branch(&worktree).await.unwrap(), "agent/p/agent-001/t1");

        // Work committed in the worktree stays on the branch after removal
        write_and_commit(&worktree, "work.txt", "done\n", "agent work").await;
        remove_worktree(dir, &worktree).await.unwrap();
        assert!(!worktree.exists());
        assert!(branch_exists(dir, "agent/p/agent-001/t1").await);

        // Removal is idempotent
        remove_worktree(dir, &worktree).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_all_clean_tree_is_noop() {
        let temp = tempdir().unwrap();
        ensure_repo(temp.path()).await.unwrap();

        let before = run_git(temp.path(), &["rev-parse", "HEAD"]).await.unwrap();
        commit_all(temp.path(), "nothing").await.unwrap();
        let after = run_git(temp.path(), &["rev-parse", "HEAD"]).await.unwrap();
        assert_eq!(before, after);
    }
}
