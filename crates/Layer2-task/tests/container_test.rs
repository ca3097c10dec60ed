//! Container engine integration: detection, argument mapping, event stream, died → retry

mod common;

use apex_foundation::{
    ApexConfig, ApexEvent, ExecutionOverrides, IsolationStrategy, TaskSpec, TaskStatus, TaskStore,
};
use apex_task::{
    ContainerConfig, ContainerError, ContainerEvent, ContainerManager, ContainerRegistry,
    ContainerRuntime, CreateContainerOptions, MonitorOptions, Orchestrator, WorkspaceManager,
};
use apex_task::container::{EventDemux, LineBuffer};
use common::{fail, missing, ok, Behaviour, DuplexEventSource, FakeStages, ScriptedRunner, WAIT};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

const RUNNING: &str = r#"{"Status":"running","Running":true,"OOMKilled":false,"ExitCode":0}"#;

fn die_line(name: &str, id: &str, exit_code: i64) -> String {
    format!(
        r#"{{"status":"die","id":"{id}","Type":"container","Action":"die","Actor":{{"ID":"{id}","Attributes":{{"exitCode":"{exit_code}","name":"{name}"}}}},"time":1714557600}}"#
    )
}

/// Poll the bus history until an event matches
async fn saw_event(orch: &Orchestrator, matches: impl Fn(&ApexEvent) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if orch.events().history(None).await.iter().any(&matches) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    false
}

/// A die for an unknown task; once it shows up on the bus, every earlier line was handled
async fn flush_listener(orch: &Orchestrator, writer: &mut tokio::io::DuplexStream) {
    writer
        .write_all(format!("{}\n", die_line("apex-task-zzz", "f1u5h0000000", 0)).as_bytes())
        .await
        .unwrap();
    assert!(
        saw_event(orch, |e| e.event_type == "container:died"
            && e.task_id.as_deref() == Some("zzz"))
        .await
    );
}

fn oom_line(name: &str, id: &str) -> String {
    format!(
        r#"{{"Type":"container","Action":"oom","Actor":{{"ID":"{id}","Attributes":{{"name":"{name}"}}}}}}"#
    )
}

#[tokio::test]
async fn test_detection_falls_back_to_podman() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("docker", &["--version"], missing("docker"))
            .on("podman", &["create"], ok("p0d0000000001")),
    );
    let manager = ContainerManager::detect(runner.clone()).await;
    assert_eq!(manager.runtime(), ContainerRuntime::Podman);

    let result = manager
        .create_container(CreateContainerOptions::new(
            ContainerConfig::new("ubuntu:22.04"),
            "t1",
        ))
        .await;
    assert!(result.success);
    assert_eq!(runner.calls_to("podman", "create").len(), 1);
    assert!(runner.calls_to("docker", "create").is_empty());
}

#[tokio::test]
async fn test_no_runtime_reports_unavailable() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("docker", &["--version"], missing("docker"))
            .on("podman", &["info"], fail(125, "cannot connect to podman socket")),
    );
    let manager = ContainerManager::detect(runner.clone()).await;
    assert_eq!(manager.runtime(), ContainerRuntime::None);

    let calls_before = runner.calls().len();
    let result = manager
        .create_container(CreateContainerOptions::new(
            ContainerConfig::new("ubuntu:22.04"),
            "t1",
        ))
        .await;
    assert!(!result.success);
    assert_eq!(result.error, Some(ContainerError::RuntimeUnavailable));
    assert_eq!(runner.calls().len(), calls_before);
}

#[test]
fn test_overrides_map_to_create_args() -> anyhow::Result<()> {
    let config = ApexConfig::default();
    let settings = config.container_for(&ExecutionOverrides::new().cpu(2.0).memory("4g"))?;
    let args = ContainerConfig::from_settings(&settings).build_create_args("t1", "ubuntu:22.04");

    assert!(args.windows(2).any(|w| w == ["--cpus", "2"]));
    assert!(args.windows(2).any(|w| w == ["--memory", "4g"]));
    assert!(args.windows(2).any(|w| w == ["--name", "apex-task-t1"]));

    assert!(config
        .container_for(&ExecutionOverrides::new().cpu(-1.0))
        .is_err());
    Ok(())
}

#[test]
fn test_demux_maps_names_and_skips_garbage() {
    let mut demux = EventDemux::new(ContainerRegistry::new());

    let died = demux
        .handle_line(&die_line("apex-task-123-abc", "c0ffee000000", 1))
        .unwrap();
    assert_eq!(died.task_id, "123-abc");
    assert_eq!(died.exit_code, Some(1));
    assert!(!died.oom_killed);

    assert!(demux.handle_line("{\"Action\": oops").is_none());
    assert!(demux
        .handle_line(&die_line("postgres", "beef00000000", 0))
        .is_none());
    assert_eq!(demux.malformed_count(), 1);

    let mut buffer = LineBuffer::new();
    let line = die_line("apex-task-t2", "aaaa00000000", 137);
    let (head, tail) = line.split_at(40);
    assert!(buffer.push(head.as_bytes()).is_empty());
    let lines = buffer.push(format!("{tail}\n").as_bytes());
    assert_eq!(lines, [line]);
    assert_eq!(buffer.pending_len(), 0);
}

#[tokio::test]
async fn test_monitor_publishes_died_events() {
    let (source, mut writer) = DuplexEventSource::pair();
    let manager = ContainerManager::new(ContainerRuntime::Docker, Arc::new(ScriptedRunner::new()))
        .with_event_source(source);
    let mut feed = manager.subscribe();

    manager
        .start_events_monitoring(MonitorOptions::new())
        .await
        .unwrap();
    assert!(manager.is_events_monitoring_active());

    writer.write_all(b"not json\n").await.unwrap();
    writer
        .write_all(oom_line("apex-task-t7", "dead00000001").as_bytes())
        .await
        .unwrap();
    writer.write_all(b"\n").await.unwrap();
    let line = die_line("apex-task-t7", "dead00000001", 137);
    let (head, tail) = line.split_at(25);
    writer.write_all(head.as_bytes()).await.unwrap();
    writer.write_all(format!("{tail}\n").as_bytes()).await.unwrap();

    let died = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ContainerEvent::Died(died)) = feed.recv().await {
                return died;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(died.task_id, "t7");
    assert_eq!(died.exit_code, Some(137));
    assert_eq!(died.signal.as_deref(), Some("SIGKILL"));
    assert!(died.oom_killed);
    assert_eq!(manager.malformed_event_count(), 1);

    manager.stop_events_monitoring().await;
    assert!(!manager.is_events_monitoring_active());
}

#[tokio::test]
async fn test_container_death_fails_and_retries_task() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("docker", &["create"], ok("c0ffee000000aaaa"))
            .on("docker", &["inspect"], ok(RUNNING)),
    );
    let (source, mut writer) = DuplexEventSource::pair();
    let containers = Arc::new(
        ContainerManager::new(ContainerRuntime::Docker, runner.clone()).with_event_source(source),
    );

    let mut config = common::config();
    config.workspace.default_strategy = IsolationStrategy::Container;
    let workspaces = WorkspaceManager::new(&config, containers.clone(), runner.clone());
    let stages = FakeStages::new(Behaviour::HangFirstAttempt);

    let orch = Orchestrator::new(
        config,
        TaskStore::in_memory().unwrap(),
        containers,
        workspaces,
        Arc::new(common::catalog()),
        stages.clone(),
    );
    orch.start().await.unwrap();
    assert!(orch.system_status().unwrap().events_monitoring);

    orch.create_task(TaskSpec::new("oom me", "build", "/repo").with_id("died-1"))
        .await
        .unwrap();
    orch.execute("died-1", ExecutionOverrides::new())
        .await
        .unwrap();
    orch.wait_for_status("died-1", &[TaskStatus::InProgress], WAIT)
        .await
        .unwrap();

    let name = "apex-task-died-1";
    let lines = format!(
        "{}\n{}\n",
        oom_line(name, "c0ffee000000aaaa"),
        die_line(name, "c0ffee000000aaaa", 137)
    );
    writer.write_all(lines.as_bytes()).await.unwrap();

    let task = orch
        .wait_for_status("died-1", &[TaskStatus::Completed], WAIT)
        .await
        .unwrap();

    assert_eq!(task.retry_count, 1);
    assert_eq!(task.exit_code, Some(137));
    assert_eq!(task.oom_killed, Some(true));
    assert!(task.logs.iter().any(|l| l
        == "Failed: Container c0ffee000000aaaa died (exit code 137, signal SIGKILL, OOM killed)"));

    // one container per attempt, each torn down
    assert_eq!(runner.calls_to("docker", "create").len(), 2);
    assert!(common::eventually(|| runner.calls_to("docker", "rm").len() == 2).await);

    let types: Vec<_> = orch
        .events()
        .history(None)
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&"container:died".to_string()));
    assert!(types.contains(&"task:retry-scheduled".to_string()));

    orch.shutdown().await;
    assert!(!orch.containers().is_events_monitoring_active());
}

#[tokio::test]
async fn test_foreign_container_death_leaves_task_running() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .on("docker", &["create"], ok("c0ffee000000aaaa"))
            .on("docker", &["inspect"], ok(RUNNING)),
    );
    let (source, mut writer) = DuplexEventSource::pair();
    let containers = Arc::new(
        ContainerManager::new(ContainerRuntime::Docker, runner.clone()).with_event_source(source),
    );

    let mut config = common::config();
    config.workspace.default_strategy = IsolationStrategy::Container;
    let workspaces = WorkspaceManager::new(&config, containers.clone(), runner.clone());
    let stages = FakeStages::new(Behaviour::HangFirstAttempt);

    let orch = Orchestrator::new(
        config,
        TaskStore::in_memory().unwrap(),
        containers,
        workspaces,
        Arc::new(common::catalog()),
        stages.clone(),
    );
    orch.start().await.unwrap();

    orch.create_task(TaskSpec::new("keep me", "build", "/repo").with_id("died-2"))
        .await
        .unwrap();
    orch.execute("died-2", ExecutionOverrides::new())
        .await
        .unwrap();
    orch.wait_for_status("died-2", &[TaskStatus::InProgress], WAIT)
        .await
        .unwrap();

    // leftover container from an earlier run carrying the same name
    writer
        .write_all(format!("{}\n", die_line("apex-task-died-2", "1eft0ver9999", 1)).as_bytes())
        .await
        .unwrap();
    flush_listener(&orch, &mut writer).await;

    assert!(
        saw_event(&orch, |e| e.event_type == "container:died"
            && e.task_id.as_deref() == Some("died-2"))
        .await
    );
    let task = orch.get_task("died-2").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.retry_count, 0);
    assert!(task.last_error.is_none());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_container_death_ignored_for_directory_workspace() {
    let runner = Arc::new(ScriptedRunner::new());
    let (source, mut writer) = DuplexEventSource::pair();
    let containers =
        ContainerManager::new(ContainerRuntime::Docker, runner.clone()).with_event_source(source);
    let h = common::harness_with(common::config(), Behaviour::Hang, containers, runner);
    let orch = &h.orchestrator;
    orch.start().await.unwrap();

    orch.create_task(TaskSpec::new("dir task", "build", "/repo").with_id("t1"))
        .await
        .unwrap();
    orch.execute("t1", ExecutionOverrides::new()).await.unwrap();
    orch.wait_for_status("t1", &[TaskStatus::InProgress], WAIT)
        .await
        .unwrap();

    writer
        .write_all(format!("{}\n", die_line("apex-task-t1", "0ther0000001", 137)).as_bytes())
        .await
        .unwrap();
    flush_listener(orch, &mut writer).await;

    let task = orch.get_task("t1").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.retry_count, 0);
    assert_eq!(h.workspaces.released("t1"), 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_lost_event_stream_is_reported() {
    let runner = Arc::new(ScriptedRunner::new());
    let (source, writer) = DuplexEventSource::pair();
    let containers =
        ContainerManager::new(ContainerRuntime::Docker, runner.clone()).with_event_source(source);
    let h = common::harness_with(common::config(), Behaviour::Succeed, containers, runner);
    let orch = &h.orchestrator;
    orch.start().await.unwrap();
    assert!(orch.system_status().unwrap().events_monitoring);

    drop(writer);

    assert!(saw_event(orch, |e| e.event_type == "container:events-interrupted").await);
    assert!(!orch.system_status().unwrap().events_monitoring);

    // the source refuses to reopen, so the monitor keeps retrying until shutdown
    orch.shutdown().await;
    assert!(!orch.containers().is_events_monitoring_active());
}
