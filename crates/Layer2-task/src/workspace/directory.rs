//! Directory workspace: a plain copy of the project under `<root>/<task-id>`

use super::{exec_on_host, handle_mismatch, WorkspaceHandle, WorkspaceProvider};
use crate::process::{CommandOutput, CommandRunner};
use apex_foundation::{Error, ExecutionOverrides, IsolationStrategy, Result, Task};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Not copied into task directories
const SKIPPED_ENTRIES: &[&str] = &[".git"];

pub struct DirectoryWorkspace {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
}

impl DirectoryWorkspace {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if SKIPPED_ENTRIES.iter().any(|s| name == *s) {
            continue;
        }

        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                std::os::unix::fs::symlink(std::fs::read_link(&from)?, &to)?;
                copied += 1;
            }
        } else {
            std::fs::copy(&from, &to)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[async_trait]
impl WorkspaceProvider for DirectoryWorkspace {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Directory
    }

    async fn acquire(&self, task: &Task, _overrides: &ExecutionOverrides) -> Result<WorkspaceHandle> {
        let src = task.project_path.clone();
        let dst = self.path_for(&task.id);

        if !src.is_dir() {
            return Err(Error::Workspace(format!(
                "Project path is not a directory: {}",
                src.display()
            )));
        }
        if dst.exists() {
            tokio::fs::remove_dir_all(&dst).await?;
        }

        let target = dst.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &target))
            .await
            .map_err(|e| Error::Internal(format!("copy task panicked: {}", e)))?
            .map_err(|e| Error::Workspace(format!("Failed to copy project: {}", e)))?;

        debug!(task_id = %task.id, files = copied, path = %dst.display(), "Project copied");

        Ok(WorkspaceHandle::Directory {
            task_id: task.id.clone(),
            path: dst,
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        let WorkspaceHandle::Directory { path, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Directory, handle));
        };

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Workspace(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        let WorkspaceHandle::Directory { path, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Directory, handle));
        };
        exec_on_host(self.runner.as_ref(), path, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TokioCommandRunner;
    use apex_foundation::TaskSpec;

    #[tokio::test]
    async fn test_copy_skips_git_and_release_deletes() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(project.path().join("README.md"), "# demo").unwrap();

        let root = tempfile::tempdir().unwrap();
        let ws = DirectoryWorkspace::new(Arc::new(TokioCommandRunner::new()), root.path());
        let task = Task::from_spec(TaskSpec::new("copy", "default", project.path()).with_id("t1"));

        let handle = ws.acquire(&task, &ExecutionOverrides::new()).await.unwrap();
        let dir = root.path().join("t1");
        assert_eq!(handle.host_path(), Some(dir.as_path()));
        assert_eq!(std::fs::read_to_string(dir.join("src/main.rs")).unwrap(), "fn main() {}");
        assert!(dir.join("README.md").exists());
        assert!(!dir.join(".git").exists());

        ws.release(&handle).await.unwrap();
        assert!(!dir.exists());
        // second release is harmless
        ws.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_project() {
        let root = tempfile::tempdir().unwrap();
        let ws = DirectoryWorkspace::new(Arc::new(TokioCommandRunner::new()), root.path());
        let task = Task::from_spec(
            TaskSpec::new("copy", "default", root.path().join("nope")).with_id("t1"),
        );
        assert!(matches!(
            ws.acquire(&task, &ExecutionOverrides::new()).await,
            Err(Error::Workspace(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_in_copy() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("a.txt"), "x").unwrap();
        let root = tempfile::tempdir().unwrap();
        let ws = DirectoryWorkspace::new(Arc::new(TokioCommandRunner::new()), root.path());
        let task = Task::from_spec(TaskSpec::new("ls", "default", project.path()).with_id("t2"));

        let handle = ws.acquire(&task, &ExecutionOverrides::new()).await.unwrap();
        let out = ws.exec_in(&handle, "ls").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "a.txt");
    }
}
