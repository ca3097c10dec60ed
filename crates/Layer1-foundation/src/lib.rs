//! # apex-foundation
//!
//! Foundation layer for Apex:
//! - Core: Task 레코드, 상태, 사용량, 생성/갱신 스펙
//! - Storage: SQLite TaskStore (영속), JsonStore (설정 파일)
//! - Config: 통합 설정 (ApexConfig - workspace / container / orchestrator / events)
//! - Event: 이벤트 버스 (task / workspace / container 이벤트 피드)
//! - Logging: tracing 구독자 초기화
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  apex-task (Orchestrator, WorkspaceManager, Containers)  │
//! │                     │                                   │
//! │       ┌─────────────┼──────────────┐                    │
//! │       ▼             ▼              ▼                    │
//! │   TaskStore      EventBus      ApexConfig               │
//! │   (SQLite)     (broadcast)   (global + project JSON)    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod logging;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Core (Task 레코드)
// ============================================================================
pub use core::{
    generate_task_id, AutonomyLevel, IsolationStrategy, Task, TaskFilter, TaskPriority, TaskSpec,
    TaskStatus, TaskUpdate, TaskUsage,
};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    ApexConfig, ContainerSettings, EventSettings, ExecutionOverrides, OrchestratorSettings,
    RetryBackoff, WorkspaceSettings, APEX_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{JsonStore, TaskStore, TASK_DB_FILE};

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{
    ApexEvent, EventBus, EventBusConfig, EventCategory, EventFilter, EventId, EventListener,
    EventSeverity, ListenerId,
};
