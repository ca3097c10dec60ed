//! Event Types - Orchestrator가 발행하는 이벤트 타입 정의
//!
//! UI/CLI 협력자가 구독하는 이벤트 피드(`task:*`, `workspace:*`, `container:*`)

use crate::core::{IsolationStrategy, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Event ID
// ============================================================================

/// 이벤트 고유 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Category / Severity
// ============================================================================

/// 이벤트 카테고리
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// 시스템 이벤트 (시작, 종료)
    System,
    /// Task 레코드 변경
    Task,
    /// 워크스페이스 획득/해제
    Workspace,
    /// 컨테이너 라이프사이클 및 엔진 이벤트
    Container,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Task => "task",
            Self::Workspace => "workspace",
            Self::Container => "container",
        }
    }
}

/// 이벤트 심각도
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

// ============================================================================
// ApexEvent
// ============================================================================

/// 이벤트 피드의 공통 구조
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApexEvent {
    pub id: EventId,

    /// 이벤트 타입 (예: "task:status-changed", "container:died")
    pub event_type: String,

    pub category: EventCategory,

    pub severity: EventSeverity,

    pub timestamp: DateTime<Utc>,

    /// 이벤트 소스 (모듈)
    pub source: String,

    /// 관련 Task (있는 경우)
    pub task_id: Option<String>,

    pub data: Value,
}

impl ApexEvent {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: Utc::now(),
            source: String::new(),
            task_id: None,
            data: Value::Null,
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// 이벤트 발생 시각을 지정 (엔진이 보고한 시각 사용)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// 사전 정의된 이벤트 타입들
// ============================================================================

/// 시스템 이벤트
pub mod system {
    use super::*;

    pub fn started(runtime: &str, monitoring: bool) -> ApexEvent {
        ApexEvent::new("system:started", EventCategory::System)
            .with_source("orchestrator")
            .with_data(json!({
                "runtime": runtime,
                "eventsMonitoring": monitoring,
            }))
    }

    pub fn shutdown() -> ApexEvent {
        ApexEvent::new("system:shutdown", EventCategory::System).with_source("orchestrator")
    }
}

/// Task 이벤트
pub mod task {
    use super::*;

    pub fn created(task: &Task) -> ApexEvent {
        ApexEvent::new("task:created", EventCategory::Task)
            .with_source("orchestrator")
            .with_task(&task.id)
            .with_data(json!({
                "description": task.description,
                "workflow": task.workflow,
                "status": task.status,
                "dependsOn": task.depends_on,
            }))
    }

    pub fn status_changed(task_id: &str, from: TaskStatus, to: TaskStatus) -> ApexEvent {
        let severity = if to == TaskStatus::Failed {
            EventSeverity::Warning
        } else {
            EventSeverity::Info
        };

        ApexEvent::new("task:status-changed", EventCategory::Task)
            .with_severity(severity)
            .with_source("orchestrator")
            .with_task(task_id)
            .with_data(json!({
                "from": from,
                "to": to,
            }))
    }

    /// 스테이지 완료 후 사용량/로그 갱신
    pub fn updated(task: &Task) -> ApexEvent {
        ApexEvent::new("task:updated", EventCategory::Task)
            .with_source("orchestrator")
            .with_task(&task.id)
            .with_data(json!({
                "status": task.status,
                "currentStage": task.current_stage,
                "usage": task.usage,
            }))
    }

    pub fn retry_scheduled(task_id: &str, retry_count: u32, delay_ms: u64) -> ApexEvent {
        ApexEvent::new("task:retry-scheduled", EventCategory::Task)
            .with_source("orchestrator")
            .with_task(task_id)
            .with_data(json!({
                "retryCount": retry_count,
                "delayMs": delay_ms,
            }))
    }

    pub fn blocked(task_id: &str, blocked_by: &[String]) -> ApexEvent {
        ApexEvent::new("task:blocked", EventCategory::Task)
            .with_source("orchestrator")
            .with_task(task_id)
            .with_data(json!({
                "blockedBy": blocked_by,
            }))
    }
}

/// 워크스페이스 이벤트
pub mod workspace {
    use super::*;

    pub fn acquired(task_id: &str, strategy: IsolationStrategy, location: &str) -> ApexEvent {
        ApexEvent::new("workspace:acquired", EventCategory::Workspace)
            .with_source("workspace")
            .with_task(task_id)
            .with_data(json!({
                "strategy": strategy,
                "location": location,
            }))
    }

    pub fn released(task_id: &str, strategy: IsolationStrategy, error: Option<&str>) -> ApexEvent {
        let severity = if error.is_some() {
            EventSeverity::Error
        } else {
            EventSeverity::Info
        };

        ApexEvent::new("workspace:released", EventCategory::Workspace)
            .with_severity(severity)
            .with_source("workspace")
            .with_task(task_id)
            .with_data(json!({
                "strategy": strategy,
                "success": error.is_none(),
                "error": error,
            }))
    }
}

/// 컨테이너 이벤트
pub mod container {
    use super::*;

    /// `container:created|started|stopped|removed`
    pub fn lifecycle(
        action: &str,
        container_id: &str,
        success: bool,
        timestamp: DateTime<Utc>,
    ) -> ApexEvent {
        let severity = if success {
            EventSeverity::Info
        } else {
            EventSeverity::Error
        };

        ApexEvent::new(format!("container:{}", action), EventCategory::Container)
            .with_severity(severity)
            .with_source("container")
            .with_data(json!({
                "containerId": container_id,
                "timestamp": timestamp,
                "success": success,
            }))
            .at(timestamp)
    }

    pub fn died(
        task_id: &str,
        container_id: &str,
        exit_code: Option<i64>,
        signal: Option<&str>,
        oom_killed: bool,
        timestamp: DateTime<Utc>,
    ) -> ApexEvent {
        ApexEvent::new("container:died", EventCategory::Container)
            .with_severity(EventSeverity::Warning)
            .with_source("container")
            .with_task(task_id)
            .with_data(json!({
                "taskId": task_id,
                "containerId": container_id,
                "exitCode": exit_code,
                "signal": signal,
                "oomKilled": oom_killed,
                "timestamp": timestamp,
            }))
            .at(timestamp)
    }

    /// `container:events-interrupted|resumed` - death detection is off while interrupted
    pub fn monitor(state: &str, reason: Option<&str>, timestamp: DateTime<Utc>) -> ApexEvent {
        let severity = if state == "interrupted" {
            EventSeverity::Warning
        } else {
            EventSeverity::Info
        };

        ApexEvent::new(format!("container:events-{}", state), EventCategory::Container)
            .with_severity(severity)
            .with_source("container")
            .with_data(json!({
                "state": state,
                "reason": reason,
                "timestamp": timestamp,
            }))
            .at(timestamp)
    }
}
