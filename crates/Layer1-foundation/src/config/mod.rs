//! Config - 통합 설정 관리
//!
//! - `apex.rs` - ApexConfig (workspace / container / orchestrator / events)

mod apex;

pub use apex::{
    ApexConfig, ContainerSettings, EventSettings, ExecutionOverrides, OrchestratorSettings,
    RetryBackoff, WorkspaceSettings, APEX_CONFIG_FILE,
};
