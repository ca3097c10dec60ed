//! Orchestrator - Task 실행 조정자
//!
//! Task 생성, 상태 전이, 워크스페이스 획득/해제, 워크플로 스테이지 실행,
//! 재시도, 의존성 게이팅, 컨테이너 사망 감지를 한 곳에서 조정합니다.
//!
//! ```text
//! create_task ─▶ TaskStore (pending)
//! execute ─────▶ queued ──(deps ok, slot)──▶ planning ──(workspace)──▶ in-progress
//!                                                                        │ stages
//!                   ┌──────────── waiting-approval / paused ◀────────────┤
//!                   │                                                    ▼
//!               approve/resume                                      completed
//!
//! ContainerManager ──container:died──▶ in-progress → failed ──(backoff)──▶ queued
//! ```
//!
//! Every read-modify-write of one task happens under that task's async lock;
//! the status itself only changes through the transition table in [`crate::state`].

use crate::container::{ContainerDiedEvent, ContainerEvent, ContainerManager, MonitorOptions};
use crate::process::{CommandRunner, TokioCommandRunner};
use crate::runtime::ContainerRuntime;
use crate::state::{is_final, validate_transition};
use crate::workflow::{StageContext, StageRunner, WorkflowCatalog};
use crate::workspace::{WorkspaceHandle, WorkspaceManager};
use apex_foundation::event::{
    container as container_events, system, task as task_events, workspace as workspace_events,
};
use apex_foundation::{
    ApexConfig, ApexEvent, AutonomyLevel, Error, EventBus, ExecutionOverrides, Result, Task,
    TaskFilter, TaskSpec, TaskStatus, TaskStore, TaskUpdate,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// Active container engine (`none` if neither docker nor podman works)
    pub runtime: ContainerRuntime,
    pub events_monitoring: bool,
    pub malformed_events: u64,
    pub running_tasks: usize,
    pub active_workspaces: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
}

struct RunSlot {
    generation: u64,
    cancel: CancellationToken,
}

type AcquisitionMap = HashMap<String, (u64, watch::Receiver<()>)>;

/// Marks a workspace acquisition in flight; receivers see the channel close
/// once the acquired workspace is registered or released
struct Acquisition {
    id: String,
    seq: u64,
    map: Arc<StdMutex<AcquisitionMap>>,
    _done: watch::Sender<()>,
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            if map.get(&self.id).map(|(seq, _)| *seq) == Some(self.seq) {
                map.remove(&self.id);
            }
        }
    }
}

/// Task Orchestrator - cheap to clone, all state is shared
#[derive(Clone)]
pub struct Orchestrator {
    store: TaskStore,
    workspaces: Arc<WorkspaceManager>,
    containers: Arc<ContainerManager>,
    catalog: Arc<dyn WorkflowCatalog>,
    stage_runner: Arc<dyn StageRunner>,
    events: Arc<EventBus>,
    config: Arc<ApexConfig>,

    /// Bounds concurrently executing tasks
    slots: Arc<Semaphore>,

    /// Per-task async locks
    task_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,

    /// Acquired, not yet released workspaces; removing an entry is the
    /// right to release it
    active: Arc<StdMutex<HashMap<String, WorkspaceHandle>>>,

    /// Executions in flight
    running: Arc<StdMutex<HashMap<String, RunSlot>>>,

    /// Workspace acquisitions in flight, awaited by `cancel_task`
    acquiring: Arc<StdMutex<AcquisitionMap>>,

    /// Overrides given to `execute`, reused by retries and resumes
    overrides: Arc<StdMutex<HashMap<String, ExecutionOverrides>>>,

    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
    listener: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

fn locked<T>(mutex: &StdMutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Internal("orchestrator state lock poisoned".to_string()))
}

impl Orchestrator {
    pub fn new(
        config: ApexConfig,
        store: TaskStore,
        containers: Arc<ContainerManager>,
        workspaces: WorkspaceManager,
        catalog: Arc<dyn WorkflowCatalog>,
        stage_runner: Arc<dyn StageRunner>,
    ) -> Self {
        let permits = config.orchestrator.max_concurrency.max(1);

        Self {
            store,
            workspaces: Arc::new(workspaces),
            containers,
            catalog,
            stage_runner,
            events: Arc::new(EventBus::new()),
            config: Arc::new(config),
            slots: Arc::new(Semaphore::new(permits)),
            task_locks: Arc::new(StdMutex::new(HashMap::new())),
            active: Arc::new(StdMutex::new(HashMap::new())),
            running: Arc::new(StdMutex::new(HashMap::new())),
            acquiring: Arc::new(StdMutex::new(HashMap::new())),
            overrides: Arc::new(StdMutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            listener: Arc::new(StdMutex::new(None)),
        }
    }

    /// Real store, detected container engine, all four workspace strategies
    pub async fn bootstrap(
        config: ApexConfig,
        catalog: Arc<dyn WorkflowCatalog>,
        stage_runner: Arc<dyn StageRunner>,
    ) -> Result<Self> {
        config.validate()?;

        let store = TaskStore::open(config.resolve_data_dir()?)?;
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());
        let containers = Arc::new(
            ContainerManager::detect(runner.clone())
                .await
                .with_settings(&config.container),
        );
        let workspaces = WorkspaceManager::new(&config, containers.clone(), runner);

        Ok(Self::new(
            config,
            store,
            containers,
            workspaces,
            catalog,
            stage_runner,
        ))
    }

    /// Share an existing bus (must be called before `start`)
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    pub fn config(&self) -> &ApexConfig {
        &self.config
    }

    /// Task / workspace / container event feed
    pub fn subscribe(&self) -> broadcast::Receiver<ApexEvent> {
        self.events.receiver()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Relay container notifications and start tailing engine events
    pub async fn start(&self) -> Result<()> {
        {
            let mut listener = locked(&self.listener)?;
            if listener.is_none() {
                *listener = Some(self.spawn_container_listener());
            }
        }

        let runtime = self.containers.runtime();
        let mut monitoring = false;
        if self.config.events.enabled && runtime.is_available() {
            let options = MonitorOptions {
                filters: self.config.events.filters.clone(),
                ..MonitorOptions::default()
            };
            match self.containers.start_events_monitoring(options).await {
                Ok(()) => monitoring = true,
                Err(e) => warn!(error = %e, "Container events monitoring unavailable"),
            }
        }

        info!(runtime = %runtime, monitoring, "Orchestrator started");
        self.events
            .publish(system::started(runtime.as_str(), monitoring))
            .await;
        Ok(())
    }

    /// Stop all executions (records keep their last persisted state)
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.slots.close();
        self.containers.stop_events_monitoring().await;

        let listener = self.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                warn!(error = %e, "Container listener ended abnormally");
            }
        }

        self.events.publish(system::shutdown()).await;
    }

    // ========================================================================
    // Task CRUD
    // ========================================================================

    /// Validate the workflow and dependencies, then persist as `pending`
    pub async fn create_task(&self, mut spec: TaskSpec) -> Result<Task> {
        self.catalog.resolve(&spec.workflow)?;

        if spec.max_retries.is_none() {
            spec.max_retries = Some(self.config.orchestrator.default_max_retries);
        }

        let mut seen = HashSet::new();
        spec.depends_on.retain(|dep| seen.insert(dep.clone()));
        if let Some(id) = &spec.id {
            if spec.depends_on.contains(id) {
                return Err(Error::Validation(format!("Task {} cannot depend on itself", id)));
            }
        }
        for dep in &spec.depends_on {
            if self.store.get_task(dep)?.is_none() {
                return Err(Error::TaskNotFound(dep.clone()));
            }
        }

        let task = self.store.create_task(spec)?;
        info!(task_id = %task.id, workflow = %task.workflow, "Task created");
        self.events.publish(task_events::created(&task)).await;
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.store.get_task(id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter)
    }

    /// Any legal status change, with the side effects of the matching operation
    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let current = self.load(id)?;

        match (current.status, status) {
            (_, TaskStatus::Cancelled) => self.cancel_task(id).await,
            (TaskStatus::Pending, TaskStatus::Queued) => self.enqueue(id).await,
            (TaskStatus::Failed, TaskStatus::Queued) => self.retry_task(id).await,
            (TaskStatus::InProgress, TaskStatus::Paused) => self.pause_task(id).await,
            (TaskStatus::Paused, TaskStatus::InProgress) => self.resume_task(id).await,
            (TaskStatus::WaitingApproval, TaskStatus::InProgress) => self.approve_task(id).await,
            _ => {
                let lock = self.task_lock(id)?;
                let guard = lock.lock().await;
                let task = self.load(id)?;
                let updated = self.transition(&task, status, TaskUpdate::new()).await?;

                if status.is_terminal() {
                    if let Some(token) = self.take_run(id)? {
                        token.cancel();
                    }
                    let failed = status == TaskStatus::Failed;
                    let retain = self.config.retain_workspace(&self.overrides_for(id)?, failed);
                    self.release_workspace(id, retain).await;
                }
                drop(guard);
                drop(lock);
                self.prune(id);

                if status == TaskStatus::Completed {
                    self.evaluate_queue().await?;
                }
                Ok(updated)
            }
        }
    }

    // ========================================================================
    // Execution control
    // ========================================================================

    /// pending → queued (started by the next [`Self::evaluate_queue`])
    pub async fn enqueue(&self, id: &str) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;

        let task = self.load(id)?;
        if task.status == TaskStatus::Queued {
            return Ok(task);
        }
        self.transition(&task, TaskStatus::Queued, TaskUpdate::new())
            .await
    }

    /// Queue the task and start it in the background
    ///
    /// Returns `DependencyUnmet` (task stays queued) while a dependency has
    /// not completed; it starts automatically once they all have.
    pub async fn execute(&self, id: &str, overrides: ExecutionOverrides) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;

        let mut task = self.load(id)?;
        match task.status {
            TaskStatus::Pending => {
                task = self
                    .transition(&task, TaskStatus::Queued, TaskUpdate::new())
                    .await?;
            }
            TaskStatus::Queued => {}
            other => return Err(Error::transition(other, TaskStatus::Planning)),
        }

        locked(&self.overrides)?.insert(id.to_string(), overrides);
        self.gate_and_start(task, false).await.map(|(task, _)| task)
    }

    /// Cancel; idempotent, the workspace is released exactly once
    ///
    /// Returns after the workspace is torn down, including one that was
    /// still being acquired when the cancel arrived.
    pub async fn cancel_task(&self, id: &str) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let guard = lock.lock().await;

        let task = self.load(id)?;
        if task.status == TaskStatus::Cancelled {
            debug!(task_id = %id, "Task already cancelled");
            return Ok(task);
        }

        let task = self
            .transition(&task, TaskStatus::Cancelled, TaskUpdate::new().log("Cancelled"))
            .await?;
        // cancel before looking for an acquisition, see prepare_workspace
        if let Some(token) = self.take_run(id)? {
            token.cancel();
        }
        let pending = locked(&self.acquiring)?
            .get(id)
            .map(|(_, done)| done.clone());

        let retain = self.overrides_for(id)?.retain_workspace.unwrap_or(false);
        self.release_workspace(id, retain).await;
        drop(guard);
        drop(lock);

        if let Some(mut done) = pending {
            debug!(task_id = %id, "Waiting for in-flight workspace acquisition");
            // never sent on; resolves when the sender drops
            let _ = done.changed().await;
        }
        self.prune(id);

        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// Manual retry from `failed` (no backoff)
    pub async fn retry_task(&self, id: &str) -> Result<Task> {
        self.requeue(id, None).await
    }

    /// in-progress → paused; the workspace is kept
    pub async fn pause_task(&self, id: &str) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;

        let task = self.load(id)?;
        let task = self
            .transition(&task, TaskStatus::Paused, TaskUpdate::new().log("Paused"))
            .await?;
        if let Some(token) = self.take_run(id)? {
            token.cancel();
        }

        info!(task_id = %id, stage = task.current_stage, "Task paused");
        Ok(task)
    }

    /// paused → in-progress, continuing at the next stage
    pub async fn resume_task(&self, id: &str) -> Result<Task> {
        self.continue_from(id, TaskStatus::Paused, "Resumed").await
    }

    /// waiting-approval → in-progress, continuing at the next stage
    pub async fn approve_task(&self, id: &str) -> Result<Task> {
        self.continue_from(id, TaskStatus::WaitingApproval, "Approved")
            .await
    }

    /// Re-check dependencies of every queued task; returns the ids started
    pub async fn evaluate_queue(&self) -> Result<Vec<String>> {
        let queued = self
            .store
            .list_tasks(&TaskFilter::new().with_status(TaskStatus::Queued))?;
        let mut started = Vec::new();

        for candidate in queued {
            let lock = self.task_lock(&candidate.id)?;
            let _guard = lock.lock().await;

            let task = self.load(&candidate.id)?;
            if task.status != TaskStatus::Queued {
                continue;
            }

            match self.gate_and_start(task, false).await {
                Ok((task, true)) => started.push(task.id),
                Ok((_, false)) | Err(Error::DependencyUnmet { .. }) => {}
                Err(e) => warn!(task_id = %candidate.id, error = %e, "Queue evaluation failed"),
            }
        }

        if !started.is_empty() {
            debug!(started = ?started, "Queued tasks released");
        }
        Ok(started)
    }

    /// Wait until the task reaches one of `targets`
    pub async fn wait_for_status(
        &self,
        id: &str,
        targets: &[TaskStatus],
        timeout: Duration,
    ) -> Result<Task> {
        let mut feed = self.events.receiver();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let task = self.load(id)?;
            if targets.contains(&task.status) {
                return Ok(task);
            }
            // any event (or a lag) is a reason to look again
            if tokio::time::timeout_at(deadline, feed.recv()).await.is_err() {
                return Err(Error::Timeout(format!(
                    "Task {} is {} after {:?}",
                    id, task.status, timeout
                )));
            }
        }
    }

    pub fn system_status(&self) -> Result<SystemStatus> {
        let counts = self.store.count_by_status()?;
        let tasks_by_status = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
            .collect();

        Ok(SystemStatus {
            runtime: self.containers.runtime(),
            events_monitoring: self.containers.is_events_monitoring_active(),
            malformed_events: self.containers.malformed_event_count(),
            running_tasks: locked(&self.running)?.len(),
            active_workspaces: locked(&self.active)?.len(),
            tasks_by_status,
        })
    }

    // ========================================================================
    // Internal: state changes (caller holds the task lock)
    // ========================================================================

    fn task_lock(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        Ok(locked(&self.task_locks)?
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn load(&self, id: &str) -> Result<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn overrides_for(&self, id: &str) -> Result<ExecutionOverrides> {
        Ok(locked(&self.overrides)?.get(id).cloned().unwrap_or_default())
    }

    /// Forget the lock and overrides of a task nothing can change any more
    fn prune(&self, id: &str) {
        let settled = match self.store.get_task(id) {
            Ok(Some(task)) => {
                is_final(task.status) || (task.status == TaskStatus::Failed && !task.can_retry())
            }
            Ok(None) => true,
            Err(_) => false,
        };
        let busy = self.running.lock().map_or(true, |r| r.contains_key(id))
            || self.acquiring.lock().map_or(true, |a| a.contains_key(id));
        if !settled || busy {
            return;
        }

        if let Ok(mut locks) = self.task_locks.lock() {
            // a clone outside the map means someone is still working on the task
            if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(id);
            }
        }
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.remove(id);
        }
    }

    fn begin_acquisition(&self, id: &str) -> Result<Acquisition> {
        let (done, waiter) = watch::channel(());
        let seq = self.generation.fetch_add(1, Ordering::SeqCst);
        locked(&self.acquiring)?.insert(id.to_string(), (seq, waiter));

        Ok(Acquisition {
            id: id.to_string(),
            seq,
            map: self.acquiring.clone(),
            _done: done,
        })
    }

    async fn transition(&self, task: &Task, to: TaskStatus, update: TaskUpdate) -> Result<Task> {
        validate_transition(task.status, to)?;

        let updated = self.store.update_task(&task.id, update.status(to))?;
        debug!(task_id = %task.id, from = %task.status, to = %to, "Task status changed");
        self.events
            .publish(task_events::status_changed(&task.id, task.status, to))
            .await;
        Ok(updated)
    }

    fn unmet_dependencies(&self, task: &Task) -> Result<Vec<String>> {
        let mut blocked = Vec::new();
        for dep in &task.depends_on {
            match self.store.get_task(dep)? {
                Some(d) if d.status == TaskStatus::Completed => {}
                _ => blocked.push(dep.clone()),
            }
        }
        Ok(blocked)
    }

    /// Queued task: record blockers, or start it. `bool` = a run was spawned
    async fn gate_and_start(&self, task: Task, replace: bool) -> Result<(Task, bool)> {
        let blocked = self.unmet_dependencies(&task)?;

        if !blocked.is_empty() {
            if task.blocked_by != blocked {
                self.store
                    .update_task(&task.id, TaskUpdate::new().blocked_by(blocked.clone()))?;
                info!(task_id = %task.id, blocked_by = ?blocked, "Task waiting for dependencies");
                self.events
                    .publish(task_events::blocked(&task.id, &blocked))
                    .await;
            }
            return Err(Error::DependencyUnmet {
                task_id: task.id,
                blocked_by: blocked,
            });
        }

        let task = if task.blocked_by.is_empty() {
            task
        } else {
            self.store
                .update_task(&task.id, TaskUpdate::new().blocked_by(Vec::new()))?
        };

        let spawned = self.spawn_run(&task.id, replace)?;
        Ok((task, spawned))
    }

    async fn continue_from(&self, id: &str, from: TaskStatus, note: &str) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;

        let task = self.load(id)?;
        if task.status != from {
            return Err(Error::transition(task.status, TaskStatus::InProgress));
        }
        let task = self
            .transition(&task, TaskStatus::InProgress, TaskUpdate::new().log(note))
            .await?;
        self.spawn_run(id, true)?;

        info!(task_id = %id, stage = task.current_stage, "Task continuing");
        Ok(task)
    }

    /// failed → queued with `retry_count + 1`
    ///
    /// `expected_retry` guards scheduled retries against a manual retry that
    /// already happened.
    async fn requeue(&self, id: &str, expected_retry: Option<u32>) -> Result<Task> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;

        let task = self.load(id)?;
        if task.status != TaskStatus::Failed {
            return Err(Error::transition(task.status, TaskStatus::Queued));
        }
        if let Some(expected) = expected_retry {
            if task.retry_count != expected {
                return Err(Error::transition(task.status, TaskStatus::Queued));
            }
        }
        if !task.can_retry() {
            return Err(Error::RetryExhausted {
                task_id: task.id,
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            });
        }

        let attempt = task.retry_count + 1;
        let update = TaskUpdate::new()
            .retry_count(attempt)
            .current_stage(0)
            .log(format!("Retry {}/{}", attempt, task.max_retries));
        let task = self.transition(&task, TaskStatus::Queued, update).await?;
        info!(task_id = %id, attempt, "Task requeued");

        self.gate_and_start(task, true).await.map(|(task, _)| task)
    }

    /// Mark failed, release the workspace, schedule an automatic retry
    async fn fail_locked(&self, task: &Task, message: &str, extra: TaskUpdate) -> Result<Task> {
        let update = extra.error(message).log(format!("Failed: {}", message));
        let failed = self.transition(task, TaskStatus::Failed, update).await?;
        warn!(task_id = %task.id, error = message, "Task failed");

        if let Some(token) = self.take_run(&task.id)? {
            token.cancel();
        }

        let retain = self.config.retain_workspace(&self.overrides_for(&task.id)?, true);
        self.release_workspace(&task.id, retain).await;
        self.schedule_retry(&failed).await;
        Ok(failed)
    }

    async fn schedule_retry(&self, task: &Task) {
        let settings = &self.config.orchestrator;
        if !settings.auto_retry {
            return;
        }
        if !task.can_retry() {
            info!(task_id = %task.id, retries = task.retry_count, "Retries exhausted");
            return;
        }

        let expected = task.retry_count;
        let delay = settings.retry_backoff.delay_for(expected + 1);
        self.events
            .publish(task_events::retry_scheduled(
                &task.id,
                expected + 1,
                delay.as_millis() as u64,
            ))
            .await;

        let this = self.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match this.requeue(&id, Some(expected)).await {
                Ok(_) | Err(Error::DependencyUnmet { .. }) => {}
                Err(Error::InvalidTransition { .. }) => {
                    debug!(task_id = %id, "Scheduled retry skipped, task moved on")
                }
                Err(e) => warn!(task_id = %id, error = %e, "Scheduled retry failed"),
            }
        });
    }

    /// Release the task's registered workspace, at most once
    async fn release_workspace(&self, id: &str, retain: bool) {
        let handle = match locked(&self.active) {
            Ok(mut active) => active.remove(id),
            Err(e) => {
                error!(task_id = %id, error = %e, "Cannot release workspace");
                None
            }
        };
        let Some(handle) = handle else {
            return;
        };

        if retain {
            info!(task_id = %id, location = %handle.location(), "Retaining workspace for inspection");
            if let Err(e) = self.store.update_task(
                id,
                TaskUpdate::new().log(format!("Workspace retained at {}", handle.location())),
            ) {
                warn!(task_id = %id, error = %e, "Failed to record retained workspace");
            }
            return;
        }

        self.release_handle(&handle).await;
    }

    async fn release_handle(&self, handle: &WorkspaceHandle) {
        let id = handle.task_id();
        let error = self.workspaces.release(handle).await.err().map(|e| e.to_string());

        if let Some(err) = &error {
            warn!(task_id = %id, error = %err, "Workspace release failed");
            if let Err(e) = self.store.update_task(
                id,
                TaskUpdate::new().log(format!("Workspace release failed: {}", err)),
            ) {
                warn!(task_id = %id, error = %e, "Failed to record release failure");
            }
        }

        self.events
            .publish(workspace_events::released(
                id,
                handle.strategy(),
                error.as_deref(),
            ))
            .await;
    }

    // ========================================================================
    // Internal: runs
    // ========================================================================

    /// `false` if a run is already in flight and `replace` is not set
    fn spawn_run(&self, id: &str, replace: bool) -> Result<bool> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();

        {
            let mut running = locked(&self.running)?;
            if let Some(existing) = running.get(id) {
                if !replace {
                    return Ok(false);
                }
                existing.cancel.cancel();
            }
            running.insert(
                id.to_string(),
                RunSlot {
                    generation,
                    cancel: cancel.clone(),
                },
            );
        }

        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.drive(&id, &cancel).await {
                error!(task_id = %id, error = %e, "Task run aborted");
            }
            this.finish_run(&id, generation);
        });
        Ok(true)
    }

    fn take_run(&self, id: &str) -> Result<Option<CancellationToken>> {
        Ok(locked(&self.running)?.remove(id).map(|slot| slot.cancel))
    }

    fn finish_run(&self, id: &str, generation: u64) {
        if let Ok(mut running) = self.running.lock() {
            if running.get(id).map(|slot| slot.generation) == Some(generation) {
                running.remove(id);
            }
        }
        self.prune(id);
    }

    async fn drive(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                // closed by shutdown
                Err(_) => return Ok(()),
            },
        };

        let Some(task) = self.begin(id, cancel).await? else {
            return Ok(());
        };
        let Some(handle) = self.prepare_workspace(&task, cancel).await? else {
            return Ok(());
        };
        self.run_stages(id, &handle, cancel).await
    }

    /// queued → planning once a slot is held; resumed runs pass through
    async fn begin(&self, id: &str, cancel: &CancellationToken) -> Result<Option<Task>> {
        let lock = self.task_lock(id)?;
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let task = self.load(id)?;
        match task.status {
            TaskStatus::Queued => {
                let blocked = self.unmet_dependencies(&task)?;
                if !blocked.is_empty() {
                    // picked up again by evaluate_queue
                    self.store
                        .update_task(id, TaskUpdate::new().blocked_by(blocked))?;
                    return Ok(None);
                }
                let task = self
                    .transition(&task, TaskStatus::Planning, TaskUpdate::new())
                    .await?;
                Ok(Some(task))
            }
            TaskStatus::InProgress => Ok(Some(task)),
            _ => Ok(None),
        }
    }

    /// Reuse the registered workspace or acquire one; moves planning → in-progress
    async fn prepare_workspace(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkspaceHandle>> {
        let existing = locked(&self.active)?.get(&task.id).cloned();
        let fresh = existing.is_none();

        // registered before the cancel check: a cancel either sees this entry
        // and waits for it, or has already cancelled the token
        let _inflight = if fresh {
            Some(self.begin_acquisition(&task.id)?)
        } else {
            None
        };
        if fresh && cancel.is_cancelled() {
            return Ok(None);
        }

        let acquired = match existing {
            Some(handle) => Ok(handle),
            None => {
                let overrides = self.overrides_for(&task.id)?;
                self.workspaces.acquire(task, &overrides).await
            }
        };

        let lock = self.task_lock(&task.id)?;
        let _guard = lock.lock().await;
        let current = self.load(&task.id)?;
        let still_ours = !cancel.is_cancelled() && current.status == task.status;

        match acquired {
            Ok(handle) if still_ours && !fresh && current.status == TaskStatus::InProgress => {
                Ok(Some(handle))
            }
            Ok(handle) if still_ours => {
                locked(&self.active)?.insert(task.id.clone(), handle.clone());

                let update = TaskUpdate::new()
                    .workspace_strategy(handle.strategy())
                    .log(format!(
                        "Workspace ready ({}: {})",
                        handle.strategy(),
                        handle.location()
                    ));
                if current.status == TaskStatus::Planning {
                    self.transition(&current, TaskStatus::InProgress, update)
                        .await?;
                } else {
                    self.store.update_task(&task.id, update)?;
                }

                self.events
                    .publish(workspace_events::acquired(
                        &task.id,
                        handle.strategy(),
                        &handle.location(),
                    ))
                    .await;
                Ok(Some(handle))
            }
            Ok(handle) => {
                // a fresh handle was never registered, so nobody else releases it
                if fresh {
                    debug!(task_id = %task.id, status = %current.status, "Task moved on during acquisition");
                    self.release_handle(&handle).await;
                }
                Ok(None)
            }
            Err(e) if still_ours => {
                self.fail_locked(
                    &current,
                    &format!("Workspace acquisition failed: {}", e),
                    TaskUpdate::new(),
                )
                .await?;
                Ok(None)
            }
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "Acquisition failed after task moved on");
                Ok(None)
            }
        }
    }

    async fn run_stages(
        &self,
        id: &str,
        handle: &WorkspaceHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let workflow = self.load(id)?.workflow;
        let stages = match self.catalog.resolve(&workflow) {
            Ok(stages) => stages,
            Err(e) => {
                let lock = self.task_lock(id)?;
                let _guard = lock.lock().await;
                let current = self.load(id)?;
                if current.status == TaskStatus::InProgress && !cancel.is_cancelled() {
                    self.fail_locked(&current, &e.to_string(), TaskUpdate::new())
                        .await?;
                }
                return Ok(());
            }
        };

        loop {
            let task = self.load(id)?;
            if task.status != TaskStatus::InProgress || cancel.is_cancelled() {
                return Ok(());
            }

            let index = task.current_stage as usize;
            let Some(stage) = stages.get(index) else {
                return self.complete(id, cancel).await;
            };

            info!(task_id = %id, stage = %stage.name, agent = %stage.agent, index, "Running stage");
            let ctx = StageContext {
                task: &task,
                stage,
                stage_index: index,
                workspace: handle,
                workspaces: &self.workspaces,
                cancel: cancel.child_token(),
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.stage_runner.run_stage(ctx) => outcome,
            };

            let lock = self.task_lock(id)?;
            let _guard = lock.lock().await;
            let current = self.load(id)?;
            if current.status != TaskStatus::InProgress || cancel.is_cancelled() {
                return Ok(());
            }

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = format!("Stage '{}' failed: {}", stage.name, e);
                    self.fail_locked(&current, &message, TaskUpdate::new())
                        .await?;
                    return Ok(());
                }
            };

            let needs_approval = match current.autonomy {
                AutonomyLevel::Manual => true,
                AutonomyLevel::Supervised => stage.requires_approval || outcome.needs_approval,
                AutonomyLevel::Autonomous => false,
            };

            let update = TaskUpdate::new()
                .usage(current.usage.accumulate(&outcome.usage))
                .logs(outcome.logs)
                .log(format!("Stage '{}' completed", stage.name))
                .artifacts(outcome.artifacts)
                .current_stage(index as u32 + 1);

            if needs_approval {
                let update = update.log(format!("Waiting for approval after '{}'", stage.name));
                self.transition(&current, TaskStatus::WaitingApproval, update)
                    .await?;
                info!(task_id = %id, stage = %stage.name, "Waiting for approval");
                return Ok(());
            }

            let updated = self.store.update_task(id, update)?;
            self.events.publish(task_events::updated(&updated)).await;
        }
    }

    async fn complete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let lock = self.task_lock(id)?;
        let guard = lock.lock().await;

        let current = self.load(id)?;
        if current.status != TaskStatus::InProgress || cancel.is_cancelled() {
            return Ok(());
        }

        let task = self
            .transition(&current, TaskStatus::Completed, TaskUpdate::new().log("Completed"))
            .await?;
        info!(
            task_id = %id,
            total_tokens = task.usage.total_tokens,
            cost = task.usage.estimated_cost,
            "Task completed"
        );

        let retain = self.config.retain_workspace(&self.overrides_for(id)?, false);
        self.release_workspace(id, retain).await;
        drop(guard);

        self.evaluate_queue().await?;
        Ok(())
    }

    // ========================================================================
    // Internal: container notifications
    // ========================================================================

    fn spawn_container_listener(&self) -> JoinHandle<()> {
        let mut feed = self.containers.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    event = feed.recv() => event,
                };

                match event {
                    Ok(ContainerEvent::Died(died)) => {
                        let task_id = died.task_id.clone();
                        if let Err(e) = this.handle_container_died(died).await {
                            warn!(task_id = %task_id, error = %e, "Failed to handle container death");
                        }
                    }
                    Ok(ContainerEvent::Lifecycle(event)) => {
                        this.events
                            .publish(container_events::lifecycle(
                                event.kind.as_str(),
                                &event.container_id,
                                event.success,
                                event.timestamp,
                            ))
                            .await;
                    }
                    Ok(ContainerEvent::Monitor(event)) => {
                        this.events
                            .publish(container_events::monitor(
                                event.state.as_str(),
                                event.reason.as_deref(),
                                event.timestamp,
                            ))
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Container notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Container listener stopped");
        })
    }

    async fn handle_container_died(&self, died: ContainerDiedEvent) -> Result<()> {
        self.events
            .publish(container_events::died(
                &died.task_id,
                &died.container_id,
                died.exit_code,
                died.signal.as_deref(),
                died.oom_killed,
                died.timestamp,
            ))
            .await;

        let lock = self.task_lock(&died.task_id)?;
        let guard = lock.lock().await;

        let Some(task) = self.store.get_task(&died.task_id)? else {
            debug!(task_id = %died.task_id, "Died container belongs to an unknown task");
            drop(guard);
            drop(lock);
            self.prune(&died.task_id);
            return Ok(());
        };
        if task.status != TaskStatus::InProgress {
            debug!(task_id = %task.id, status = %task.status, "Ignoring container exit");
            return Ok(());
        }
        let owned = locked(&self.active)?
            .get(&task.id)
            .is_some_and(|handle| handle.owns_container(&died.container_id));
        if !owned {
            debug!(
                task_id = %task.id,
                container = %died.container_id,
                "Ignoring exit of a container that is not the task's workspace"
            );
            return Ok(());
        }

        let message = describe_death(&died);
        self.fail_locked(
            &task,
            &message,
            TaskUpdate::new().container_exit(died.exit_code, died.oom_killed),
        )
        .await?;
        Ok(())
    }
}

fn describe_death(died: &ContainerDiedEvent) -> String {
    let mut details = vec![match died.exit_code {
        Some(code) => format!("exit code {}", code),
        None => "exit code unknown".to_string(),
    }];
    if let Some(signal) = &died.signal {
        details.push(format!("signal {}", signal));
    }
    if died.oom_killed {
        details.push("OOM killed".to_string());
    }
    format!(
        "Container {} died ({})",
        died.container_id,
        details.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use crate::workflow::{StageDefinition, StageOutcome, StaticWorkflowCatalog};
    use crate::workspace::PassthroughWorkspace;
    use apex_foundation::IsolationStrategy;
    use async_trait::async_trait;
    use chrono::Utc;

    struct NoopStages;

    #[async_trait]
    impl StageRunner for NoopStages {
        async fn run_stage(&self, _ctx: StageContext<'_>) -> Result<StageOutcome> {
            Ok(StageOutcome::new().log("done"))
        }
    }

    fn orchestrator() -> Orchestrator {
        let runner = Arc::new(ScriptedRunner::new());
        let containers = Arc::new(ContainerManager::new(ContainerRuntime::None, runner.clone()));
        let workspaces = WorkspaceManager::empty(IsolationStrategy::None)
            .with_provider(Arc::new(PassthroughWorkspace::new(runner)));
        let mut config = ApexConfig::default();
        config.workspace.default_strategy = IsolationStrategy::None;
        let catalog = StaticWorkflowCatalog::new()
            .with_workflow("build", vec![StageDefinition::new("code", "coder")]);

        Orchestrator::new(
            config,
            TaskStore::in_memory().unwrap(),
            containers,
            workspaces,
            Arc::new(catalog),
            Arc::new(NoopStages),
        )
    }

    fn tracked(orch: &Orchestrator, id: &str) -> bool {
        orch.task_locks.lock().unwrap().contains_key(id)
            || orch.overrides.lock().unwrap().contains_key(id)
    }

    #[tokio::test]
    async fn test_settled_tasks_are_forgotten() {
        let project = tempfile::tempdir().unwrap();
        let orch = orchestrator();

        orch.create_task(TaskSpec::new("run", "build", project.path()).with_id("done"))
            .await
            .unwrap();
        orch.execute("done", ExecutionOverrides::new().strategy(IsolationStrategy::None))
            .await
            .unwrap();
        assert!(tracked(&orch, "done"));
        orch.wait_for_status("done", &[TaskStatus::Completed], Duration::from_secs(5))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tracked(&orch, "done") && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!tracked(&orch, "done"));

        orch.create_task(TaskSpec::new("drop", "build", project.path()).with_id("idle"))
            .await
            .unwrap();
        orch.cancel_task("idle").await.unwrap();
        assert!(!tracked(&orch, "idle"));
        assert_eq!(
            orch.get_task("idle").unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_describe_death() {
        let died = ContainerDiedEvent {
            task_id: "t1".to_string(),
            container_id: "abc".to_string(),
            exit_code: Some(137),
            signal: Some("SIGKILL".to_string()),
            oom_killed: true,
            timestamp: Utc::now(),
        };
        assert_eq!(
            describe_death(&died),
            "Container abc died (exit code 137, signal SIGKILL, OOM killed)"
        );

        let died = ContainerDiedEvent {
            exit_code: None,
            signal: None,
            oom_killed: false,
            ..died
        };
        assert_eq!(describe_death(&died), "Container abc died (exit code unknown)");
    }
}
