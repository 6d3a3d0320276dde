//! Worktree driver: git worktree and branch management.

use crate::error::WorktreeError;
use std::path::Path;
use std::process::Output;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// Timeout for git worktree/branch subprocess calls.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum slug length inside a branch name.
const SLUG_MAX: usize = 50;

static SLUG_INVALID: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[^a-zA-Z0-9_-]").unwrap());
static SLUG_DASHES: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"-+").unwrap());

/// Sanitize free text for use as a git branch slug.
///
/// Lower-cases, replaces every non-`[A-Za-z0-9_-]` with `-`, collapses dash
/// runs, trims dashes, truncates to 50 chars, and falls back to `task` when
/// nothing survives. Idempotent.
pub fn sanitize_for_branch(text: &str) -> String {
    let lowered = text.to_lowercase();
    let replaced = SLUG_INVALID.replace_all(&lowered, "-");
    let collapsed = SLUG_DASHES.replace_all(&replaced, "-");
    let trimmed = collapsed.trim_matches('-');
    let truncated: String = trimmed.chars().take(SLUG_MAX).collect();
    if truncated.is_empty() {
        "task".to_string()
    } else {
        truncated
    }
}

async fn run_git(repo: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo)
        .args(args)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE");

    match tokio::time::timeout(GIT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => {
            tracing::error!(%error, "failed to run git");
            Err(WorktreeError::Exec(error.to_string()))
        }
        Err(_) => {
            tracing::error!(args = ?args, "git command timed out");
            Err(WorktreeError::Timeout(args.join(" ")))
        }
    }
}

/// Create a new worktree at `worktree_path` on a freshly created branch
/// `new_branch` rooted at `base_branch`.
pub async fn create_worktree(
    project_path: &Path,
    new_branch: &str,
    base_branch: &str,
    worktree_path: &Path,
) -> Result<(), WorktreeError> {
    if let Some(parent) = worktree_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WorktreeError::Exec(format!("failed to create worktree parent dir: {e}")))?;
    }

    let path_str = worktree_path.display().to_string();
    let output = run_git(
        project_path,
        &["worktree", "add", "-b", new_branch, &path_str, base_branch],
    )
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::AddFailed(stderr.trim().to_string()));
    }
    Ok(())
}

/// Remove a worktree. Best-effort and idempotent; failures are logged.
pub async fn remove_worktree(project_path: &Path, worktree_path: &Path, force: bool) -> bool {
    let path_str = worktree_path.display().to_string();
    let mut args = vec!["worktree", "remove", path_str.as_str()];
    if force {
        args.push("--force");
    }
    match run_git(project_path, &args).await {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            tracing::warn!(
                worktree = %worktree_path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git worktree remove failed (best-effort)"
            );
            false
        }
        Err(_) => false,
    }
}

/// Delete a local branch. Best-effort and idempotent; failures are logged.
pub async fn delete_branch(project_path: &Path, branch: &str) -> bool {
    match run_git(project_path, &["branch", "-D", branch]).await {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            tracing::warn!(
                branch = %branch,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git branch delete failed (best-effort)"
            );
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_basic_text() {
        assert_eq!(sanitize_for_branch("Fix login bug"), "fix-login-bug");
        assert_eq!(sanitize_for_branch("add  CI/CD pipeline!"), "add-ci-cd-pipeline");
    }

    #[test]
    fn collapses_and_trims_dashes() {
        assert_eq!(sanitize_for_branch("--weird---input--"), "weird-input");
        assert_eq!(sanitize_for_branch("***"), "task");
        assert_eq!(sanitize_for_branch(""), "task");
    }

    #[test]
    fn truncates_to_fifty_chars() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_for_branch(&long).len(), 50);
    }

    #[test]
    fn sanitizer_is_idempotent() {
        for input in ["Fix login bug", "--weird---input--", "***", "ünïcode tāsk", &"x".repeat(90)] {
            let once = sanitize_for_branch(input);
            assert_eq!(sanitize_for_branch(&once), once);
        }
    }

    #[test]
    fn preserves_underscores() {
        assert_eq!(sanitize_for_branch("run_tests please"), "run_tests-please");
    }

    #[tokio::test]
    async fn worktree_lifecycle_against_real_repo() {
        // Skip silently when git isn't available in the environment.
        if tokio::process::Command::new("git")
            .arg("--version")
            .output()
            .await
            .is_err()
        {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "forge@test"],
            vec!["config", "user.name", "forge"],
        ] {
            tokio::process::Command::new("git")
                .arg("-C")
                .arg(&repo)
                .args(&args)
                .output()
                .await
                .unwrap();
        }
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            tokio::process::Command::new("git")
                .arg("-C")
                .arg(&repo)
                .args(&args)
                .output()
                .await
                .unwrap();
        }

        let worktree = repo.join(".worktrees").join("ab12cd");
        create_worktree(&repo, "agent/ab12cd/task", "main", &worktree)
            .await
            .unwrap();
        assert!(worktree.join("README.md").exists());

        assert!(remove_worktree(&repo, &worktree, true).await);
        assert!(delete_branch(&repo, "agent/ab12cd/task").await);
        assert!(!worktree.exists());

        // Idempotent: deleting again fails softly without panicking.
        assert!(!delete_branch(&repo, "agent/ab12cd/task").await);
    }
}
