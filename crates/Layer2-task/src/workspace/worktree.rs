//! Git worktree workspace: `<root>/<task-id>` checked out on the task branch

use super::{exec_on_host, handle_mismatch, WorkspaceHandle, WorkspaceProvider};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use apex_foundation::{Error, ExecutionOverrides, IsolationStrategy, Result, Task};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct WorktreeWorkspace {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl WorktreeWorkspace {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<CommandOutput> {
        let spec = CommandSpec::new("git")
            .arg("-C")
            .arg(repo.to_string_lossy())
            .args(args.iter().copied())
            .timeout(GIT_TIMEOUT);

        self.runner
            .run(&spec)
            .await
            .map_err(|e| Error::Workspace(e.to_string()))
    }

    /// Leftover from a crashed run; `false` if git refused part of the cleanup
    async fn clear_stale(&self, repo: &Path, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(true);
        }
        warn!(path = %path.display(), "Removing stale worktree");

        let path_str = path.to_string_lossy();
        let removed = self
            .git(repo, &["worktree", "remove", "--force", &*path_str])
            .await?;
        let mut clean = report_failure(&removed, "git worktree remove", path);
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        let pruned = self.git(repo, &["worktree", "prune"]).await?;
        clean &= report_failure(&pruned, "git worktree prune", path);
        Ok(clean)
    }
}

fn report_failure(output: &CommandOutput, action: &str, path: &Path) -> bool {
    if !output.success() {
        warn!(
            path = %path.display(),
            error = %output.error_text(),
            "{} failed during stale worktree cleanup",
            action
        );
    }
    output.success()
}

#[async_trait]
impl WorkspaceProvider for WorktreeWorkspace {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Worktree
    }

    async fn acquire(&self, task: &Task, _overrides: &ExecutionOverrides) -> Result<WorkspaceHandle> {
        let repo = task.project_path.clone();
        let path = self.path_for(&task.id);
        let path_str = path.to_string_lossy().to_string();
        let branch = task.branch_name.clone();

        tokio::fs::create_dir_all(&self.root).await?;
        self.clear_stale(&repo, &path).await?;

        let output = self
            .git(&repo, &["worktree", "add", "-b", branch.as_str(), path_str.as_str()])
            .await?;

        if !output.success() {
            let stderr = output.error_text();
            if !stderr.contains("already exists") {
                return Err(Error::Workspace(format!("git worktree add failed: {}", stderr)));
            }

            // Branch survives from an earlier attempt: check it out again
            debug!(task_id = %task.id, branch = %branch, "Reusing existing task branch");
            let output = self.git(&repo, &["worktree", "add", path_str.as_str(), branch.as_str()]).await?;
            if !output.success() {
                return Err(Error::Workspace(format!(
                    "git worktree add failed: {}",
                    output.error_text()
                )));
            }
        }

        Ok(WorkspaceHandle::Worktree {
            task_id: task.id.clone(),
            path,
            branch,
            repo,
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        let WorkspaceHandle::Worktree { path, repo, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Worktree, handle));
        };

        let path_str = path.to_string_lossy();
        let output = self
            .git(repo, &["worktree", "remove", "--force", &*path_str])
            .await?;

        if output.success() || !path.exists() {
            Ok(())
        } else {
            Err(Error::Workspace(format!(
                "git worktree remove failed: {}",
                output.error_text()
            )))
        }
    }

    async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        let WorkspaceHandle::Worktree { path, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Worktree, handle));
        };
        exec_on_host(self.runner.as_ref(), path, command).await
    }
}
