//! `none` strategy: the task works directly in the project path
//!
//! No isolation at all. Changes land in the user's checkout immediately.

use super::{exec_on_host, handle_mismatch, WorkspaceHandle, WorkspaceProvider};
use crate::process::{CommandOutput, CommandRunner};
use apex_foundation::{Error, ExecutionOverrides, IsolationStrategy, Result, Task};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct PassthroughWorkspace {
    runner: Arc<dyn CommandRunner>,
}

impl PassthroughWorkspace {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkspaceProvider for PassthroughWorkspace {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::None
    }

    async fn acquire(&self, task: &Task, _overrides: &ExecutionOverrides) -> Result<WorkspaceHandle> {
        if !task.project_path.is_dir() {
            return Err(Error::Workspace(format!(
                "Project path is not a directory: {}",
                task.project_path.display()
            )));
        }

        warn!(
            task_id = %task.id,
            path = %task.project_path.display(),
            "No workspace isolation: task runs directly in the project"
        );

        Ok(WorkspaceHandle::Passthrough {
            task_id: task.id.clone(),
            path: task.project_path.clone(),
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        match handle {
            WorkspaceHandle::Passthrough { .. } => Ok(()),
            other => Err(handle_mismatch(IsolationStrategy::None, other)),
        }
    }

    async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        let WorkspaceHandle::Passthrough { path, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::None, handle));
        };
        exec_on_host(self.runner.as_ref(), path, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok, ScriptedRunner};
    use apex_foundation::TaskSpec;

    #[tokio::test]
    async fn test_passthrough_uses_project_path() {
        let project = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("sh", &["-c"], ok("done")));
        let ws = PassthroughWorkspace::new(runner.clone());
        let task = Task::from_spec(TaskSpec::new("edit", "default", project.path()).with_id("t1"));

        let handle = ws.acquire(&task, &ExecutionOverrides::new()).await.unwrap();
        assert_eq!(handle.host_path(), Some(project.path()));

        let out = ws.exec_in(&handle, "make").await.unwrap();
        assert_eq!(out.stdout, "done");
        let call = &runner.calls()[0];
        assert_eq!(call.args, ["-c", "make"]);
        assert_eq!(call.cwd.as_deref(), Some(project.path()));

        ws.release(&handle).await.unwrap();
        assert!(project.path().exists());
    }
}
