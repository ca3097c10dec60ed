//! Fakes shared by the integration tests

#![allow(dead_code)]

use apex_foundation::{
    ApexConfig, Error, ExecutionOverrides, IsolationStrategy, Result, RetryBackoff, Task,
    TaskStore, TaskUsage,
};
use apex_task::{
    CommandOutput, ContainerError, ContainerManager, ContainerRuntime, EventSource, EventStream,
    MonitorOptions, Orchestrator, StageContext, StageDefinition, StageOutcome, StageRunner,
    StaticWorkflowCatalog, WorkspaceHandle, WorkspaceManager, WorkspaceProvider,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;

pub use apex_task::test_support::{fail, missing, ok, ScriptedRunner};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Event source
// ============================================================================

/// Hands out one in-memory stream; the test writes engine lines into the other end
pub struct DuplexEventSource {
    reader: Mutex<Option<DuplexStream>>,
}

impl DuplexEventSource {
    pub fn pair() -> (Arc<Self>, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(4096);
        let source = Arc::new(Self {
            reader: Mutex::new(Some(reader)),
        });
        (source, writer)
    }
}

#[async_trait]
impl EventSource for DuplexEventSource {
    async fn open(
        &self,
        _runtime: ContainerRuntime,
        _options: &MonitorOptions,
    ) -> std::result::Result<EventStream, ContainerError> {
        let reader = self.reader.lock().unwrap().take();
        reader
            .map(EventStream::from_reader)
            .ok_or_else(|| ContainerError::Events("stream already taken".to_string()))
    }
}

// ============================================================================
// Workspace provider
// ============================================================================

/// Directory-strategy stand-in that only counts calls
#[derive(Default)]
pub struct CountingWorkspace {
    started: Mutex<HashMap<String, usize>>,
    acquired: Mutex<HashMap<String, usize>>,
    released: Mutex<HashMap<String, usize>>,
    fail_acquire: Mutex<bool>,
    acquire_delay: Mutex<Duration>,
}

impl CountingWorkspace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `acquire` calls entered, finished or not
    pub fn started(&self, task_id: &str) -> usize {
        self.started.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }

    pub fn acquired(&self, task_id: &str) -> usize {
        self.acquired.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }

    pub fn released(&self, task_id: &str) -> usize {
        self.released.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }

    pub fn fail_acquire(&self, fail: bool) {
        *self.fail_acquire.lock().unwrap() = fail;
    }

    /// Make `acquire` take this long, like a container being created
    pub fn slow_acquire(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl WorkspaceProvider for CountingWorkspace {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Directory
    }

    async fn acquire(&self, task: &Task, _overrides: &ExecutionOverrides) -> Result<WorkspaceHandle> {
        *self.started.lock().unwrap().entry(task.id.clone()).or_default() += 1;
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_acquire.lock().unwrap() {
            return Err(Error::Workspace("disk full".to_string()));
        }
        *self.acquired.lock().unwrap().entry(task.id.clone()).or_default() += 1;
        Ok(WorkspaceHandle::Directory {
            task_id: task.id.clone(),
            path: std::env::temp_dir().join("apex-test").join(&task.id),
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        *self
            .released
            .lock()
            .unwrap()
            .entry(handle.task_id().to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn exec_in(&self, _handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            stdout: command.to_string(),
            stderr: String::new(),
        })
    }
}

// ============================================================================
// Stage runner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behaviour {
    /// Every stage reports 100 in / 50 out tokens
    Succeed,
    /// First attempt hangs until cancelled, retries succeed
    HangFirstAttempt,
    /// First attempt's first stage errors, retries succeed
    FailFirstAttempt,
    /// Every stage hangs until cancelled
    Hang,
}

pub struct FakeStages {
    behaviour: Behaviour,
    runs: Mutex<Vec<(String, String, u32)>>,
}

impl FakeStages {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            runs: Mutex::new(Vec::new()),
        })
    }

    /// (task id, stage name, retry count) per invocation
    pub fn runs(&self) -> Vec<(String, String, u32)> {
        self.runs.lock().unwrap().clone()
    }

    pub fn stage_names(&self, task_id: &str) -> Vec<String> {
        self.runs()
            .into_iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, stage, _)| stage)
            .collect()
    }
}

#[async_trait]
impl StageRunner for FakeStages {
    async fn run_stage(&self, ctx: StageContext<'_>) -> Result<StageOutcome> {
        self.runs.lock().unwrap().push((
            ctx.task.id.clone(),
            ctx.stage.name.clone(),
            ctx.task.retry_count,
        ));

        let first_attempt = ctx.task.retry_count == 0;
        let hang = match self.behaviour {
            Behaviour::Hang => true,
            Behaviour::HangFirstAttempt => first_attempt,
            _ => false,
        };
        if hang {
            ctx.cancel.cancelled().await;
            return Err(Error::Cancelled);
        }
        if self.behaviour == Behaviour::FailFirstAttempt && first_attempt {
            return Err(Error::Internal("model returned garbage".to_string()));
        }

        Ok(StageOutcome::new()
            .with_usage(TaskUsage::new(100, 50, 0.01))
            .log(format!("{} done", ctx.stage.name))
            .artifact(format!("{}.md", ctx.stage.name)))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn catalog() -> StaticWorkflowCatalog {
    StaticWorkflowCatalog::new()
        .with_workflow(
            "build",
            vec![
                StageDefinition::new("plan", "planner"),
                StageDefinition::new("implement", "coder"),
            ],
        )
        .with_workflow(
            "reviewed",
            vec![
                StageDefinition::new("implement", "coder").requiring_approval(),
                StageDefinition::new("test", "tester"),
            ],
        )
}

pub fn config() -> ApexConfig {
    let mut config = ApexConfig::default();
    config.workspace.default_strategy = IsolationStrategy::Directory;
    config.orchestrator.max_concurrency = 4;
    config.orchestrator.default_max_retries = 2;
    config.orchestrator.retry_backoff = RetryBackoff::Fixed { delay_ms: 10 };
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub workspaces: Arc<CountingWorkspace>,
    pub stages: Arc<FakeStages>,
    pub runner: Arc<ScriptedRunner>,
}

pub fn harness(behaviour: Behaviour) -> Harness {
    let runner = Arc::new(ScriptedRunner::new());
    let containers = ContainerManager::new(ContainerRuntime::None, runner.clone());
    harness_with(config(), behaviour, containers, runner)
}

pub fn harness_with(
    config: ApexConfig,
    behaviour: Behaviour,
    containers: ContainerManager,
    runner: Arc<ScriptedRunner>,
) -> Harness {
    let workspaces = CountingWorkspace::new();
    let stages = FakeStages::new(behaviour);
    let manager =
        WorkspaceManager::empty(IsolationStrategy::Directory).with_provider(workspaces.clone());

    let orchestrator = Orchestrator::new(
        config,
        TaskStore::in_memory().unwrap(),
        Arc::new(containers),
        manager,
        Arc::new(catalog()),
        stages.clone(),
    );

    Harness {
        orchestrator,
        workspaces,
        stages,
        runner,
    }
}

/// Poll `condition` until it holds or [`WAIT`] passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
