//! Container workspace: one container per task, project mounted at `/workspace`

use super::{handle_mismatch, WorkspaceHandle, WorkspaceProvider};
use crate::container::{
    container_name, ContainerConfig, ContainerManager, CreateContainerOptions, ExecOptions,
    VolumeMount,
};
use crate::process::CommandOutput;
use apex_foundation::{ApexConfig, Error, ExecutionOverrides, IsolationStrategy, Result, Task};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Mount point of the project inside task containers
pub const CONTAINER_WORKDIR: &str = "/workspace";

pub struct ContainerWorkspace {
    containers: Arc<ContainerManager>,
    config: ApexConfig,
}

impl ContainerWorkspace {
    pub fn new(containers: Arc<ContainerManager>, config: ApexConfig) -> Self {
        Self { containers, config }
    }

    fn container_config(&self, task: &Task, overrides: &ExecutionOverrides) -> Result<ContainerConfig> {
        let settings = self.config.container_for(overrides)?;
        let mut config = ContainerConfig::from_settings(&settings)
            .with_volume(VolumeMount::new(&task.project_path, CONTAINER_WORKDIR));
        if config.working_dir.is_none() {
            config = config.with_working_dir(CONTAINER_WORKDIR);
        }
        Ok(config)
    }
}

#[async_trait]
impl WorkspaceProvider for ContainerWorkspace {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Container
    }

    async fn acquire(&self, task: &Task, overrides: &ExecutionOverrides) -> Result<WorkspaceHandle> {
        let config = self.container_config(task, overrides)?;

        // kept from a failed attempt; the name would clash
        if let Some(stale) = self.containers.registry().container_for_task(&task.id) {
            warn!(task_id = %task.id, container = %stale.container_id, "Removing container from previous attempt");
            self.containers
                .remove_container(&stale.container_id)
                .await
                .into_result()?;
        }

        let container_id = self
            .containers
            .create_container(CreateContainerOptions::new(config, &task.id).auto_start(true))
            .await
            .into_result()?;

        Ok(WorkspaceHandle::Container {
            task_id: task.id.clone(),
            container_id,
            name: container_name(&task.id),
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        let WorkspaceHandle::Container { container_id, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Container, handle));
        };

        let stopped = self.containers.stop_container(container_id).await;
        if !stopped.success {
            // rm -f below still kills it
            warn!(container = %container_id, error = ?stopped.error, "Stop failed during release");
        }

        let removed = self.containers.remove_container(container_id).await;
        match removed.error {
            Some(err) if !removed.success => Err(Error::from(err)),
            _ => Ok(()),
        }
    }

    async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        let WorkspaceHandle::Container { container_id, .. } = handle else {
            return Err(handle_mismatch(IsolationStrategy::Container, handle));
        };

        self.containers
            .exec_command(container_id, command, ExecOptions::in_dir(CONTAINER_WORKDIR))
            .await
            .into_output()
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerRuntime;
    use crate::test_support::{fail, ok, ScriptedRunner};
    use apex_foundation::TaskSpec;

    const RUNNING: &str = r#"{"Status":"running","Running":true,"OOMKilled":false,"ExitCode":0}"#;

    fn workspace(runner: Arc<ScriptedRunner>, config: ApexConfig) -> ContainerWorkspace {
        let manager = ContainerManager::new(ContainerRuntime::Docker, runner);
        ContainerWorkspace::new(Arc::new(manager), config)
    }

    fn task() -> Task {
        Task::from_spec(TaskSpec::new("build it", "default", "/repo").with_id("t1"))
    }

    #[tokio::test]
    async fn test_acquire_mounts_project_and_applies_overrides() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("docker", &["create"], ok("c1d2e3f4a5b6"))
                .on("docker", &["inspect"], ok(RUNNING)),
        );
        let ws = workspace(runner.clone(), ApexConfig::default());

        let handle = ws
            .acquire(&task(), &ExecutionOverrides::new().cpu(2.0).memory("4g"))
            .await
            .unwrap();
        assert_eq!(handle.location(), "c1d2e3f4a5b6");

        let create = &runner.calls_to("docker", "create")[0].args;
        assert!(create.windows(2).any(|w| w == ["-v", "/repo:/workspace"]));
        assert!(create.windows(2).any(|w| w == ["-w", "/workspace"]));
        assert!(create.windows(2).any(|w| w == ["--cpus", "2"]));
        assert!(create.windows(2).any(|w| w == ["--memory", "4g"]));
    }

    #[tokio::test]
    async fn test_acquire_rejects_bad_memory_override() {
        let runner = Arc::new(ScriptedRunner::new());
        let ws = workspace(runner.clone(), ApexConfig::default());

        let err = ws
            .acquire(&task(), &ExecutionOverrides::new().memory("lots"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_failure_is_structured() {
        let runner = Arc::new(ScriptedRunner::new().on("docker", &["create"], fail(125, "no space left")));
        let err = workspace(runner, ApexConfig::default())
            .acquire(&task(), &ExecutionOverrides::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerOperation { ref operation, .. } if operation == "create"));
    }

    #[tokio::test]
    async fn test_acquire_removes_previous_attempt() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("docker", &["create"], ok("c1d2e3f4a5b6"))
                .on("docker", &["inspect"], ok(RUNNING)),
        );
        let ws = workspace(runner.clone(), ApexConfig::default());

        ws.acquire(&task(), &ExecutionOverrides::new()).await.unwrap();
        assert!(runner.calls_to("docker", "rm").is_empty());

        ws.acquire(&task(), &ExecutionOverrides::new()).await.unwrap();
        let rm = runner.calls_to("docker", "rm");
        assert_eq!(rm.len(), 1);
        assert_eq!(rm[0].args.last().map(String::as_str), Some("c1d2e3f4a5b6"));
    }

    #[tokio::test]
    async fn test_release_stops_then_removes() {
        let runner = Arc::new(ScriptedRunner::new().on("docker", &["stop"], fail(1, "already stopped")));
        let ws = workspace(runner.clone(), ApexConfig::default());
        let handle = WorkspaceHandle::Container {
            task_id: "t1".to_string(),
            container_id: "c1".to_string(),
            name: "apex-task-t1".to_string(),
        };

        ws.release(&handle).await.unwrap();
        let subcommands: Vec<_> = runner.calls().iter().map(|c| c.args[0].clone()).collect();
        assert_eq!(subcommands, ["stop", "rm"]);
    }

    #[tokio::test]
    async fn test_exec_runs_in_workdir() {
        let runner = Arc::new(ScriptedRunner::new().on("docker", &["exec"], ok("hello\n")));
        let ws = workspace(runner.clone(), ApexConfig::default());
        let handle = WorkspaceHandle::Container {
            task_id: "t1".to_string(),
            container_id: "c1".to_string(),
            name: "apex-task-t1".to_string(),
        };

        let out = ws.exec_in(&handle, "echo hello").await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(runner.calls_to("docker", "exec")[0].args[1..3], ["-w", "/workspace"]);

        let wrong = WorkspaceHandle::Directory {
            task_id: "t1".to_string(),
            path: "/tmp/x".into(),
        };
        assert!(matches!(ws.exec_in(&wrong, "true").await, Err(Error::Workspace(_))));
    }
}
