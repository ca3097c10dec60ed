//! # apex-task
//!
//! Task orchestration engine for Apex.
//! Runs multi-stage workflows for tasks, each inside its own isolated workspace.
//!
//! ## Features
//!
//! - Task lifecycle with a strict status transition table
//! - Workspace isolation: container, git worktree, directory copy, none
//! - Docker / Podman through their CLIs, with automatic fallback
//! - Container event monitoring (`container:died` → failed → retry)
//! - Dependency gating, bounded concurrency, retry with backoff
//! - Approval checkpoints by autonomy level
//!
//! ## 구조
//!
//! ```text
//! Orchestrator ──▶ WorkflowCatalog / StageRunner  (agent side, injected)
//!      │
//!      ├──▶ WorkspaceManager ──▶ ContainerWorkspace ──▶ ContainerManager ──▶ docker|podman
//!      │                      ├─▶ WorktreeWorkspace  ──▶ git
//!      │                      ├─▶ DirectoryWorkspace
//!      │                      └─▶ PassthroughWorkspace
//!      │
//!      └──▶ TaskStore / EventBus / ApexConfig  (apex-foundation)
//! ```

pub mod container;
pub mod orchestrator;
pub mod process;
pub mod runtime;
pub mod state;
pub mod workflow;
pub mod workspace;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

// Orchestrator
pub use orchestrator::{Orchestrator, SystemStatus};
pub use state::{allowed_targets, can_transition, is_final, validate_transition};
pub use workflow::{
    StageContext, StageDefinition, StageOutcome, StageRunner, StaticWorkflowCatalog,
    WorkflowCatalog,
};

// Workspaces
pub use workspace::{
    ContainerWorkspace, DirectoryWorkspace, PassthroughWorkspace, WorkspaceHandle,
    WorkspaceManager, WorkspaceProvider, WorktreeWorkspace, CONTAINER_WORKDIR,
};

// Containers
pub use container::{
    ContainerConfig, ContainerDiedEvent, ContainerError, ContainerEvent, ContainerManager,
    ContainerOperationResult, ContainerRegistry, CreateContainerOptions, EventSource,
    EventStream, ExecOptions, ExecResult, MonitorOptions, NetworkMode, ResourceLimits,
    SecurityProfile, VolumeMount,
};
pub use runtime::{ContainerRuntime, RuntimeDetector};

// Process
pub use process::{CommandOutput, CommandRunner, CommandSpec, ProcessError, TokioCommandRunner};
