//! Container engine event stream
//!
//! One long-lived `<engine> events` subprocess per manager. Its stdout is
//! split into lines (a record may straddle two reads), every line is parsed
//! on its own, docker and podman payloads are normalised into [`EngineEvent`],
//! and `die` events for Apex containers become [`ContainerDiedEvent`]s.
//!
//! ```text
//! engine stdout ─▶ LineBuffer ─▶ parse_event_line ─▶ EventDemux ─▶ broadcast<ContainerEvent>
//!                  (partial tail)  (per line, tolerant)  (name / label / registry)
//! ```

use super::config::{CONTAINER_NAME_PREFIX, MANAGED_LABEL, TASK_ID_LABEL};
use super::error::ContainerError;
use super::registry::ContainerRegistry;
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Events emitted by the manager
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Created,
    Started,
    Stopped,
    Removed,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub container_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiedEvent {
    pub task_id: String,
    pub container_id: String,
    pub exit_code: Option<i64>,
    pub signal: Option<String>,
    pub oom_killed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    /// Stream ended or failed; reconnecting
    Interrupted,
    /// Stream reopened after an interruption
    Resumed,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::Resumed => "resumed",
        }
    }
}

/// The shared event stream went away or came back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEvent {
    pub state: MonitorState,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Notification fan-out of [`super::ContainerManager`]
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    Lifecycle(LifecycleEvent),
    Died(ContainerDiedEvent),
    Monitor(MonitorEvent),
}

impl ContainerEvent {
    /// `container:<action>`
    pub fn event_type(&self) -> String {
        match self {
            Self::Lifecycle(e) => format!("container:{}", e.kind.as_str()),
            Self::Died(_) => "container:died".to_string(),
            Self::Monitor(e) => format!("container:events-{}", e.state.as_str()),
        }
    }
}

// ============================================================================
// Line splitting
// ============================================================================

/// Byte buffer that yields complete `\n`-terminated lines
///
/// Works on bytes so a multi-byte character split across reads is kept whole.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; returns every line it completed (without terminator)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.pending, rest);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left after the stream ended
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Normalised engine event
// ============================================================================

/// Engine-independent shape of one container event
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    /// Lowercase action (`create`, `start`, `die`, `oom`, ...)
    pub action: String,
    pub container_id: String,
    pub name: Option<String>,
    pub attributes: HashMap<String, String>,
    pub exit_code: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Parse one JSON line from either engine
///
/// `Ok(None)` for well-formed records that are not container events.
pub fn parse_event_line(line: &str) -> Result<Option<EngineEvent>, ContainerError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ContainerError::Events(format!("invalid JSON ({}): {}", e, truncate(line))))?;

    let Value::Object(obj) = value else {
        return Err(ContainerError::Events(format!(
            "expected an object: {}",
            truncate(line)
        )));
    };

    if obj.contains_key("Actor") || obj.contains_key("Action") {
        parse_docker(&obj, line)
    } else if obj.contains_key("Status") || obj.contains_key("Name") {
        parse_podman(&obj, line)
    } else {
        Err(ContainerError::Events(format!(
            "unrecognised event shape: {}",
            truncate(line)
        )))
    }
}

// {"status":"die","id":"…","Type":"container","Action":"die",
//  "Actor":{"ID":"…","Attributes":{"exitCode":"137","name":"apex-task-…"}},
//  "time":1700000000,"timeNano":1700000000123456789}
fn parse_docker(obj: &Map<String, Value>, line: &str) -> Result<Option<EngineEvent>, ContainerError> {
    if !is_container_type(obj) {
        return Ok(None);
    }

    let actor = obj.get("Actor").and_then(Value::as_object);
    let attributes = actor
        .and_then(|a| a.get("Attributes"))
        .map(string_map)
        .unwrap_or_default();

    let action = str_field(obj, "Action")
        .or_else(|| str_field(obj, "status"))
        .ok_or_else(|| ContainerError::Events(format!("missing action: {}", truncate(line))))?;

    let container_id = actor
        .and_then(|a| str_field(a, "ID"))
        .or_else(|| str_field(obj, "id"))
        .ok_or_else(|| ContainerError::Events(format!("missing container id: {}", truncate(line))))?;

    let timestamp = obj
        .get("timeNano")
        .and_then(Value::as_i64)
        .and_then(from_nanos)
        .or_else(|| {
            obj.get("time")
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
        .unwrap_or_else(Utc::now);

    let exit_code = attributes.get("exitCode").and_then(|c| c.parse().ok());

    Ok(Some(EngineEvent {
        action: normalize_action(&action),
        container_id,
        name: attributes.get("name").cloned(),
        attributes,
        exit_code,
        timestamp,
    }))
}

// {"ID":"…","Image":"…","Name":"apex-task-…","Status":"died","Type":"container",
//  "Time":"2024-05-01T10:00:00.123456789Z","ContainerExitCode":137,"Attributes":{…}}
fn parse_podman(obj: &Map<String, Value>, line: &str) -> Result<Option<EngineEvent>, ContainerError> {
    if !is_container_type(obj) {
        return Ok(None);
    }

    let action = str_field(obj, "Status")
        .ok_or_else(|| ContainerError::Events(format!("missing status: {}", truncate(line))))?;
    let container_id = str_field(obj, "ID")
        .ok_or_else(|| ContainerError::Events(format!("missing container id: {}", truncate(line))))?;

    let attributes = obj.get("Attributes").map(string_map).unwrap_or_default();

    let exit_code = match obj.get("ContainerExitCode") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };

    let timestamp = match obj.get("Time") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(Value::Number(n)) => n.as_i64().and_then(|t| {
            // podman prints seconds on older releases, nanoseconds on newer ones
            if t > 100_000_000_000_000 {
                from_nanos(t)
            } else {
                DateTime::from_timestamp(t, 0)
            }
        }),
        _ => None,
    }
    .unwrap_or_else(Utc::now);

    Ok(Some(EngineEvent {
        action: normalize_action(&action),
        container_id,
        name: str_field(obj, "Name"),
        attributes,
        exit_code,
        timestamp,
    }))
}

fn is_container_type(obj: &Map<String, Value>) -> bool {
    match obj.get("Type").and_then(Value::as_str) {
        Some(kind) => kind.eq_ignore_ascii_case("container"),
        None => true,
    }
}

fn normalize_action(action: &str) -> String {
    // "exec_start: sh -c ls" → "exec_start"
    let action = action.split(':').next().unwrap_or(action).trim();
    match action.to_ascii_lowercase().as_str() {
        "died" => "die".to_string(),
        other => other.to_string(),
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_map(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), v))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn from_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(
        nanos.div_euclid(1_000_000_000),
        nanos.rem_euclid(1_000_000_000) as u32,
    )
}

fn truncate(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

/// Conventional signal name for a `128 + n` exit status
pub fn signal_from_exit_code(code: i64) -> Option<&'static str> {
    if code <= 128 {
        return None;
    }
    let name = match code - 128 {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(name)
}

// ============================================================================
// Demultiplexer
// ============================================================================

/// Attributes engine events to tasks and turns `die` into [`ContainerDiedEvent`]
///
/// OOM marks are kept per container id so one container's `oom` never
/// leaks into another's `die`.
pub struct EventDemux {
    registry: ContainerRegistry,
    oom_marked: HashSet<String>,
    malformed: Arc<AtomicU64>,
}

impl EventDemux {
    pub fn new(registry: ContainerRegistry) -> Self {
        Self {
            registry,
            oom_marked: HashSet::new(),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn with_counter(registry: ContainerRegistry, malformed: Arc<AtomicU64>) -> Self {
        Self {
            registry,
            oom_marked: HashSet::new(),
            malformed,
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Task id for an event, or `None` if the container is not ours
    pub fn task_id_for(&self, event: &EngineEvent) -> Option<String> {
        if let Some(task_id) = event
            .name
            .as_deref()
            .and_then(|n| n.trim_start_matches('/').strip_prefix(CONTAINER_NAME_PREFIX))
            .filter(|id| !id.is_empty())
        {
            return Some(task_id.to_string());
        }

        if let Some(task_id) = event.attribute(TASK_ID_LABEL).filter(|id| !id.is_empty()) {
            return Some(task_id.to_string());
        }

        if let Some(task_id) = self.registry.task_for(&event.container_id) {
            return Some(task_id);
        }

        if event.attribute(MANAGED_LABEL) == Some("true") {
            debug!(container = %event.container_id, "Managed container without task id");
        }
        None
    }

    /// Feed one raw line
    pub fn handle_line(&mut self, line: &str) -> Option<ContainerDiedEvent> {
        match parse_event_line(line) {
            Ok(Some(event)) => self.handle_event(event),
            Ok(None) => None,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Skipping malformed container event");
                None
            }
        }
    }

    pub fn handle_event(&mut self, event: EngineEvent) -> Option<ContainerDiedEvent> {
        let task_id = self.task_id_for(&event)?;
        trace!(task_id = %task_id, action = %event.action, container = %event.container_id, "Container event");

        match event.action.as_str() {
            "oom" => {
                self.oom_marked.insert(event.container_id);
                None
            }
            "die" => {
                let marked = self.oom_marked.remove(&event.container_id);
                let oom_killed = marked
                    || matches!(
                        event
                            .attribute("oomKilled")
                            .or_else(|| event.attribute("OOMKilled")),
                        Some("true")
                    );
                let signal = event
                    .attribute("signal")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .or_else(|| {
                        event
                            .exit_code
                            .and_then(signal_from_exit_code)
                            .map(str::to_string)
                    });

                Some(ContainerDiedEvent {
                    task_id,
                    container_id: event.container_id,
                    exit_code: event.exit_code,
                    signal,
                    oom_killed,
                    timestamp: event.timestamp,
                })
            }
            "destroy" | "remove" => {
                self.oom_marked.remove(&event.container_id);
                None
            }
            _ => None,
        }
    }
}

// ============================================================================
// Event source
// ============================================================================

/// An opened engine event stream
pub struct EventStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Owning subprocess (killed when monitoring stops)
    pub child: Option<Child>,
}

impl EventStream {
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOptions {
    /// Extra `--filter` values (e.g. `label=apex.managed=true`)
    pub filters: Vec<String>,
    /// First wait before reopening an ended stream; doubles per failed attempt
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_delay: Duration::from_secs(10),
        }
    }
}

impl MonitorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }
}

/// Opens the engine's event stream (injected so tests can feed synthetic data)
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(
        &self,
        runtime: ContainerRuntime,
        options: &MonitorOptions,
    ) -> Result<EventStream, ContainerError>;
}

/// `<engine> events --format json` subprocess
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEventSource;

impl ProcessEventSource {
    pub fn build_args(runtime: ContainerRuntime, options: &MonitorOptions) -> Vec<String> {
        let format = match runtime {
            ContainerRuntime::Podman => "json",
            _ => "{{json .}}",
        };

        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            format.to_string(),
            "--filter".to_string(),
            "type=container".to_string(),
        ];
        for filter in &options.filters {
            args.push("--filter".to_string());
            args.push(filter.clone());
        }
        args
    }
}

#[async_trait]
impl EventSource for ProcessEventSource {
    async fn open(
        &self,
        runtime: ContainerRuntime,
        options: &MonitorOptions,
    ) -> Result<EventStream, ContainerError> {
        let binary = runtime.command().ok_or(ContainerError::RuntimeUnavailable)?;

        let mut child = Command::new(binary)
            .args(Self::build_args(runtime, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::Events(format!("failed to spawn {} events: {}", binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContainerError::Events("events stdout not captured".to_string()))?;

        Ok(EventStream {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }
}

// ============================================================================
// Monitor
// ============================================================================

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the shared events subprocess and its reader task
pub struct EventsMonitor {
    source: Arc<dyn EventSource>,
    registry: ContainerRegistry,
    events_tx: broadcast::Sender<ContainerEvent>,
    handle: Mutex<Option<MonitorHandle>>,
    active: Arc<AtomicBool>,
    malformed: Arc<AtomicU64>,
}

impl EventsMonitor {
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: ContainerRegistry,
        events_tx: broadcast::Sender<ContainerEvent>,
    ) -> Self {
        Self {
            source,
            registry,
            events_tx,
            handle: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Malformed lines skipped since creation
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Start tailing; a second call while active is a no-op
    pub async fn start(
        &self,
        runtime: ContainerRuntime,
        options: &MonitorOptions,
    ) -> Result<(), ContainerError> {
        if self.is_active() {
            debug!("Events monitoring already active");
            return Ok(());
        }
        if !runtime.is_available() {
            return Err(ContainerError::RuntimeUnavailable);
        }

        let stream = self.source.open(runtime, options).await?;
        let cancel = CancellationToken::new();
        let demux = EventDemux::with_counter(self.registry.clone(), self.malformed.clone());

        self.active.store(true, Ordering::SeqCst);
        let task = tokio::spawn(run_monitor(
            stream,
            Reconnect {
                source: self.source.clone(),
                runtime,
                options: options.clone(),
            },
            demux,
            self.events_tx.clone(),
            cancel.clone(),
            self.active.clone(),
        ));

        let previous = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(MonitorHandle { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(runtime = %runtime, "Container events monitoring started");
        Ok(())
    }

    /// Stop tailing and wait for the reader to exit
    pub async fn stop(&self) {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Events monitor task ended abnormally");
            }
            info!("Container events monitoring stopped");
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventsMonitor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                handle.cancel.cancel();
            }
        }
    }
}

/// What the reader needs to reopen the stream
struct Reconnect {
    source: Arc<dyn EventSource>,
    runtime: ContainerRuntime,
    options: MonitorOptions,
}

/// Tail `stream`; when it ends, reopen with backoff until cancelled
async fn run_monitor(
    mut stream: EventStream,
    reconnect: Reconnect,
    mut demux: EventDemux,
    events_tx: broadcast::Sender<ContainerEvent>,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
) {
    let notify = |state: MonitorState, reason: Option<String>| {
        // no subscribers is fine
        let _ = events_tx.send(ContainerEvent::Monitor(MonitorEvent {
            state,
            reason,
            timestamp: Utc::now(),
        }));
    };

    loop {
        let ended = read_stream(&mut stream, &mut demux, &events_tx, &cancel).await;
        if let Some(mut child) = stream.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Events subprocess already exited");
            }
        }
        let Some(reason) = ended else {
            break;
        };

        active.store(false, Ordering::SeqCst);
        warn!(reason = %reason, "Container event stream interrupted, reconnecting");
        notify(MonitorState::Interrupted, Some(reason));

        match reopen(&reconnect, &cancel).await {
            Some(reopened) => {
                stream = reopened;
                active.store(true, Ordering::SeqCst);
                info!("Container event stream resumed");
                notify(MonitorState::Resumed, None);
            }
            None => break,
        }
    }

    active.store(false, Ordering::SeqCst);
}

/// Read until the stream ends (`Some(reason)`) or the monitor is stopped (`None`)
async fn read_stream(
    stream: &mut EventStream,
    demux: &mut EventDemux,
    events_tx: &broadcast::Sender<ContainerEvent>,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];

    let emit = |died: ContainerDiedEvent| {
        info!(
            task_id = %died.task_id,
            container = %died.container_id,
            exit_code = ?died.exit_code,
            oom_killed = died.oom_killed,
            "Container died"
        );
        let _ = events_tx.send(ContainerEvent::Died(died));
    };

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return None,
            read = stream.reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                if let Some(tail) = lines.finish() {
                    if let Some(died) = demux.handle_line(&tail) {
                        emit(died);
                    }
                }
                return Some("event stream ended".to_string());
            }
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    if let Some(died) = demux.handle_line(&line) {
                        emit(died);
                    }
                }
            }
            Err(e) => return Some(format!("event stream read failed: {}", e)),
        }
    }
}

/// `None` once cancelled
async fn reopen(reconnect: &Reconnect, cancel: &CancellationToken) -> Option<EventStream> {
    let mut delay = reconnect.options.reconnect_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;

        match reconnect
            .source
            .open(reconnect.runtime, &reconnect.options)
            .await
        {
            Ok(stream) => return Some(stream),
            Err(e) => {
                debug!(attempt, error = %e, "Reopening container event stream failed");
                delay = (delay * 2).min(reconnect.options.max_reconnect_delay);
            }
        }
    }
}
