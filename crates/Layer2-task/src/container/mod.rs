//! Container engine integration
//!
//! - `config`: 컨테이너 설정 → `<engine> create` 인자 변환
//! - `manager`: create/start/stop/remove/exec/inspect/stats
//! - `events`: 엔진 이벤트 스트림 모니터 (`container:died`)
//! - `registry`: 컨테이너 이름/ID → Task ID

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;

pub use config::{
    container_name, image_tag, ContainerConfig, NetworkMode, ResourceLimits, SecurityProfile,
    VolumeMount, CONTAINER_NAME_PREFIX, MANAGED_LABEL, TASK_ID_LABEL,
};
pub use error::ContainerError;
pub use events::{
    parse_event_line, signal_from_exit_code, ContainerDiedEvent, ContainerEvent, EngineEvent,
    EventDemux, EventSource, EventStream, EventsMonitor, LifecycleEvent, LifecycleKind,
    LineBuffer, MonitorEvent, MonitorOptions, MonitorState, ProcessEventSource,
};
pub use manager::{
    parse_stats, ContainerManager, ContainerOperationResult, ContainerState, ContainerStats,
    CreateContainerOptions, ExecOptions, ExecResult, StatsResult,
};
pub use registry::{ContainerRegistry, RegisteredContainer};
