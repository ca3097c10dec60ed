//! Container lifecycle management
//!
//! Drives the detected engine CLI (docker or podman). Expected failures are
//! returned inside structured results instead of `Err`, so callers can decide
//! between failing the task and falling back to another isolation strategy.

use super::config::{container_name, image_tag, ContainerConfig};
use super::error::ContainerError;
use super::events::{
    ContainerEvent, EventSource, EventsMonitor, LifecycleEvent, LifecycleKind, MonitorOptions,
    ProcessEventSource,
};
use super::registry::ContainerRegistry;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::runtime::{ContainerRuntime, RuntimeDetector};
use apex_foundation::ContainerSettings;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ============================================================================
// Results
// ============================================================================

/// Outcome of create/start/stop/remove
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOperationResult {
    pub success: bool,
    pub container_id: Option<String>,
    pub error: Option<ContainerError>,
}

impl ContainerOperationResult {
    pub fn ok(container_id: impl Into<String>) -> Self {
        Self {
            success: true,
            container_id: Some(container_id.into()),
            error: None,
        }
    }

    pub fn failed(container_id: Option<String>, error: ContainerError) -> Self {
        Self {
            success: false,
            container_id,
            error: Some(error),
        }
    }

    /// Container id on success
    pub fn into_result(self) -> Result<String, ContainerError> {
        match (self.success, self.container_id, self.error) {
            (true, Some(id), _) => Ok(id),
            (_, _, Some(err)) => Err(err),
            (_, id, None) => Err(ContainerError::Inspect(format!(
                "operation reported no container id ({:?})",
                id
            ))),
        }
    }
}

/// Outcome of `exec`
///
/// A command that ran and exited non-zero is still `success: true`; only
/// engine-level failures (unknown or stopped container, spawn, timeout) are not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<ContainerError>,
}

impl ExecResult {
    fn failed(error: ContainerError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn into_output(self) -> Result<CommandOutput, ContainerError> {
        match self.error {
            Some(err) if !self.success => Err(err),
            _ => Ok(CommandOutput {
                status: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOptions {
    pub working_dir: Option<String>,
}

impl ExecOptions {
    pub fn in_dir(dir: impl Into<String>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

/// Point-in-time resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub pids: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsResult {
    pub success: bool,
    pub stats: Option<ContainerStats>,
    pub error: Option<ContainerError>,
}

/// Parsed `.State` of `inspect`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: Option<i64>,
    #[serde(rename = "OOMKilled", default)]
    pub oom_killed: bool,
}

#[derive(Debug, Clone)]
pub struct CreateContainerOptions {
    pub config: ContainerConfig,
    pub task_id: String,
    pub auto_start: bool,
}

impl CreateContainerOptions {
    pub fn new(config: ContainerConfig, task_id: impl Into<String>) -> Self {
        Self {
            config,
            task_id: task_id.into(),
            auto_start: false,
        }
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct ContainerManager {
    runtime: ContainerRuntime,
    runner: Arc<dyn CommandRunner>,
    registry: ContainerRegistry,
    events_tx: broadcast::Sender<ContainerEvent>,
    monitor: EventsMonitor,
    operation_timeout: Duration,
    build_timeout: Duration,
    stop_timeout_secs: u64,
}

impl ContainerManager {
    pub fn new(runtime: ContainerRuntime, runner: Arc<dyn CommandRunner>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let registry = ContainerRegistry::new();
        let monitor = EventsMonitor::new(
            Arc::new(ProcessEventSource),
            registry.clone(),
            events_tx.clone(),
        );

        Self {
            runtime,
            runner,
            registry,
            events_tx,
            monitor,
            operation_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(600),
            stop_timeout_secs: 10,
        }
    }

    /// Probe docker, then podman, and manage whichever answers
    pub async fn detect(runner: Arc<dyn CommandRunner>) -> Self {
        let runtime = RuntimeDetector::new(runner.clone()).best_runtime().await;
        Self::new(runtime, runner)
    }

    /// Replace the events source (tests feed a synthetic stream)
    pub fn with_event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.monitor = EventsMonitor::new(source, self.registry.clone(), self.events_tx.clone());
        self
    }

    pub fn with_settings(mut self, settings: &ContainerSettings) -> Self {
        self.operation_timeout = settings.operation_timeout();
        self.stop_timeout_secs = settings.stop_timeout_secs;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Lifecycle and `container:died` notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events_tx.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn create_container(&self, options: CreateContainerOptions) -> ContainerOperationResult {
        let CreateContainerOptions {
            config,
            task_id,
            auto_start,
        } = options;
        let name = container_name(&task_id);

        if !self.runtime.is_available() {
            self.emit_lifecycle(LifecycleKind::Created, &name, false);
            return ContainerOperationResult::failed(None, ContainerError::RuntimeUnavailable);
        }

        // Optional image build
        let mut image = config.image.clone();
        if let Some(build_args) = config.build_image_args(&task_id) {
            info!(task_id = %task_id, dockerfile = ?config.dockerfile, "Building task image");
            let mut args = vec!["build".to_string()];
            args.extend(build_args);
            match self.engine("build", args, self.build_timeout).await {
                Ok(output) if output.success() => image = image_tag(&task_id),
                Ok(output) => {
                    self.emit_lifecycle(LifecycleKind::Created, &name, false);
                    return ContainerOperationResult::failed(
                        None,
                        ContainerError::Build(output.error_text()),
                    );
                }
                Err(e) => {
                    self.emit_lifecycle(LifecycleKind::Created, &name, false);
                    return ContainerOperationResult::failed(None, e);
                }
            }
        }

        let mut args = vec!["create".to_string()];
        args.extend(config.build_create_args(&task_id, &image));

        info!(task_id = %task_id, container = %name, image = %image, runtime = %self.runtime, "Creating container");

        let container_id = match self.engine("create", args, self.operation_timeout).await {
            // engines may print pull progress before the id
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or(name.as_str())
                .to_string(),
            Ok(output) => {
                self.emit_lifecycle(LifecycleKind::Created, &name, false);
                return ContainerOperationResult::failed(
                    None,
                    ContainerError::Create(output.error_text()),
                );
            }
            Err(e) => {
                self.emit_lifecycle(LifecycleKind::Created, &name, false);
                return ContainerOperationResult::failed(None, e);
            }
        };

        self.registry.register(&name, &container_id, &task_id);
        self.emit_lifecycle(LifecycleKind::Created, &container_id, true);

        if auto_start {
            let started = self.start_container(&container_id).await;
            if !started.success {
                if config.auto_remove {
                    warn!(container = %container_id, "Start failed, removing half-created container");
                    let removed = self.remove_container(&container_id).await;
                    if !removed.success {
                        warn!(container = %container_id, error = ?removed.error, "Cleanup after failed start failed");
                    }
                }
                return ContainerOperationResult::failed(Some(container_id), started.error.unwrap_or_else(|| {
                    ContainerError::Start("container did not start".to_string())
                }));
            }
        }

        ContainerOperationResult::ok(container_id)
    }

    /// Start and confirm through `inspect` that the container is running
    pub async fn start_container(&self, id: &str) -> ContainerOperationResult {
        let result = match self
            .engine("start", vec!["start".to_string(), id.to_string()], self.operation_timeout)
            .await
        {
            Ok(output) if output.success() => match self.inspect_state(id).await {
                Ok(state) if state.running => ContainerOperationResult::ok(id),
                Ok(state) => ContainerOperationResult::failed(
                    Some(id.to_string()),
                    ContainerError::Start(format!(
                        "container is {} (exit code {})",
                        if state.status.is_empty() { "not running" } else { state.status.as_str() },
                        state.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()),
                    )),
                ),
                Err(e) => ContainerOperationResult::failed(Some(id.to_string()), e),
            },
            Ok(output) => ContainerOperationResult::failed(
                Some(id.to_string()),
                ContainerError::Start(output.error_text()),
            ),
            Err(e) => ContainerOperationResult::failed(Some(id.to_string()), e),
        };

        if result.success {
            debug!(container = %id, "Container started");
        }
        self.emit_lifecycle(LifecycleKind::Started, id, result.success);
        result
    }

    pub async fn stop_container(&self, id: &str) -> ContainerOperationResult {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.stop_timeout_secs.to_string(),
            id.to_string(),
        ];
        // the engine itself waits up to stop_timeout_secs before killing
        let timeout = self.operation_timeout + Duration::from_secs(self.stop_timeout_secs);

        let result = match self.engine("stop", args, timeout).await {
            Ok(output) if output.success() => ContainerOperationResult::ok(id),
            Ok(output) => ContainerOperationResult::failed(
                Some(id.to_string()),
                ContainerError::Stop(output.error_text()),
            ),
            Err(e) => ContainerOperationResult::failed(Some(id.to_string()), e),
        };

        self.emit_lifecycle(LifecycleKind::Stopped, id, result.success);
        result
    }

    /// Force-remove; an already-gone container counts as removed
    pub async fn remove_container(&self, id: &str) -> ContainerOperationResult {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];

        let result = match self.engine("remove", args, self.operation_timeout).await {
            Ok(output) if output.success() => ContainerOperationResult::ok(id),
            Ok(output) if is_missing_container(&output.stderr) => {
                debug!(container = %id, "Container already removed");
                ContainerOperationResult::ok(id)
            }
            Ok(output) => ContainerOperationResult::failed(
                Some(id.to_string()),
                ContainerError::Remove(output.error_text()),
            ),
            Err(e) => ContainerOperationResult::failed(Some(id.to_string()), e),
        };

        if result.success {
            self.registry.forget(id);
        }
        self.emit_lifecycle(LifecycleKind::Removed, id, result.success);
        result
    }

    // ========================================================================
    // Exec / inspect / stats
    // ========================================================================

    pub async fn exec_command(&self, id: &str, command: &str, options: ExecOptions) -> ExecResult {
        let mut args = vec!["exec".to_string()];
        if let Some(dir) = &options.working_dir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }
        args.extend([id.to_string(), "sh".to_string(), "-c".to_string(), command.to_string()]);

        debug!(container = %id, command, "Exec in container");

        match self.engine("exec", args, self.operation_timeout).await {
            Ok(output) if !output.success() && is_engine_exec_error(&output.stderr) => {
                ExecResult::failed(ContainerError::Exec(output.error_text()))
            }
            Ok(output) => ExecResult {
                success: true,
                exit_code: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
                error: None,
            },
            Err(e) => ExecResult::failed(e),
        }
    }

    pub async fn inspect_state(&self, id: &str) -> Result<ContainerState, ContainerError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            id.to_string(),
        ];

        let output = self.engine("inspect", args, self.operation_timeout).await?;
        if !output.success() {
            return Err(ContainerError::Inspect(output.error_text()));
        }

        serde_json::from_str(output.stdout.trim())
            .map_err(|e| ContainerError::Inspect(format!("unexpected inspect output: {}", e)))
    }

    pub async fn get_stats(&self, id: &str) -> StatsResult {
        let format = match self.runtime {
            ContainerRuntime::Podman => "json",
            _ => "{{json .}}",
        };
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            format.to_string(),
            id.to_string(),
        ];

        let parsed = match self.engine("stats", args, self.operation_timeout).await {
            Ok(output) if output.success() => parse_stats(&output.stdout),
            Ok(output) => Err(ContainerError::Stats(output.error_text())),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(stats) => StatsResult {
                success: true,
                stats: Some(stats),
                error: None,
            },
            Err(e) => StatsResult {
                success: false,
                stats: None,
                error: Some(e),
            },
        }
    }

    // ========================================================================
    // Events monitoring
    // ========================================================================

    pub async fn start_events_monitoring(&self, options: MonitorOptions) -> Result<(), ContainerError> {
        self.monitor.start(self.runtime, &options).await
    }

    pub async fn stop_events_monitoring(&self) {
        self.monitor.stop().await;
    }

    pub fn is_events_monitoring_active(&self) -> bool {
        self.monitor.is_active()
    }

    /// Malformed event lines skipped so far
    pub fn malformed_event_count(&self) -> u64 {
        self.monitor.malformed_count()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    async fn engine(
        &self,
        operation: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<CommandOutput, ContainerError> {
        let binary = self.runtime.command().ok_or(ContainerError::RuntimeUnavailable)?;
        let spec = CommandSpec::new(binary).args(args).timeout(timeout);

        self.runner
            .run(&spec)
            .await
            .map_err(|e| ContainerError::from_process(operation, e))
    }

    fn emit_lifecycle(&self, kind: LifecycleKind, container_id: &str, success: bool) {
        if !success {
            warn!(container = %container_id, action = kind.as_str(), "Container operation failed");
        }
        let _ = self.events_tx.send(ContainerEvent::Lifecycle(LifecycleEvent {
            kind,
            container_id: container_id.to_string(),
            success,
            timestamp: Utc::now(),
        }));
    }
}

fn engine_error_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?im)^error\b.*(no such container|no container with name or id|is not running|state improper)",
            )
            .ok()
        })
        .as_ref()
}

fn is_engine_exec_error(stderr: &str) -> bool {
    match engine_error_pattern() {
        Some(re) => re.is_match(stderr),
        None => is_missing_container(stderr),
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

/// docker: `{"CPUPerc":"1.5%","MemPerc":"0.4%","PIDs":"3",…}`
/// podman: `[{"cpu_percent":"1.5%","mem_percent":"0.4%","pids":3,…}]`
pub fn parse_stats(output: &str) -> Result<ContainerStats, ContainerError> {
    let first_line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ContainerError::Stats("empty stats output".to_string()))?;

    let value: Value = serde_json::from_str(if first_line.starts_with('[') {
        output.trim()
    } else {
        first_line
    })
    .map_err(|e| ContainerError::Stats(format!("unexpected stats output: {}", e)))?;

    let record = match &value {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| ContainerError::Stats("empty stats array".to_string()))?,
        other => other,
    };

    let pick = |keys: &[&str]| keys.iter().find_map(|k| record.get(*k));

    let cpu = pick(&["CPUPerc", "cpu_percent", "CPU"]).and_then(parse_number);
    let mem = pick(&["MemPerc", "mem_percent", "MemPercent"]).and_then(parse_number);
    let pids = pick(&["PIDs", "pids", "PIDS"]).and_then(parse_number);

    match (cpu, mem) {
        (Some(cpu_percent), Some(memory_percent)) => Ok(ContainerStats {
            cpu_percent,
            memory_percent,
            pids: pids.map(|p| p.max(0.0) as u64).unwrap_or(0),
        }),
        _ => Err(ContainerError::Stats(format!(
            "missing cpu/memory fields: {}",
            record
        ))),
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}
