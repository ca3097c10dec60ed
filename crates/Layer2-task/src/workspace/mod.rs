//! Workspace isolation
//!
//! Task 하나를 격리 자원 하나에 묶습니다. 전략마다 같은 계약을 구현합니다:
//!
//! | Strategy    | Handle                 | acquire                     | release                      |
//! |-------------|------------------------|-----------------------------|------------------------------|
//! | `container` | container id / name    | create + start              | stop + rm -f                 |
//! | `worktree`  | worktree path + branch | `git worktree add -b`       | `git worktree remove --force`|
//! | `directory` | copied directory       | recursive copy (no `.git`)  | delete                       |
//! | `none`      | project path           | nothing (no isolation!)     | nothing                      |

mod container;
mod directory;
mod passthrough;
mod worktree;

pub use container::{ContainerWorkspace, CONTAINER_WORKDIR};
pub use directory::DirectoryWorkspace;
pub use passthrough::PassthroughWorkspace;
pub use worktree::WorktreeWorkspace;

use crate::container::ContainerManager;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use apex_foundation::{ApexConfig, Error, ExecutionOverrides, IsolationStrategy, Result, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Handle
// ============================================================================

/// Strategy-specific reference to an acquired workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum WorkspaceHandle {
    Container {
        task_id: String,
        container_id: String,
        name: String,
    },
    Worktree {
        task_id: String,
        path: PathBuf,
        branch: String,
        repo: PathBuf,
    },
    Directory {
        task_id: String,
        path: PathBuf,
    },
    #[serde(rename = "none")]
    Passthrough {
        task_id: String,
        path: PathBuf,
    },
}

impl WorkspaceHandle {
    pub fn strategy(&self) -> IsolationStrategy {
        match self {
            Self::Container { .. } => IsolationStrategy::Container,
            Self::Worktree { .. } => IsolationStrategy::Worktree,
            Self::Directory { .. } => IsolationStrategy::Directory,
            Self::Passthrough { .. } => IsolationStrategy::None,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Container { task_id, .. }
            | Self::Worktree { task_id, .. }
            | Self::Directory { task_id, .. }
            | Self::Passthrough { task_id, .. } => task_id,
        }
    }

    /// Container id or host path, for logs and events
    pub fn location(&self) -> String {
        match self {
            Self::Container { container_id, .. } => container_id.clone(),
            Self::Worktree { path, .. }
            | Self::Directory { path, .. }
            | Self::Passthrough { path, .. } => path.display().to_string(),
        }
    }

    /// True if this is a container workspace running `container_id`
    ///
    /// Engines report both short (12 hex) and full ids, so either may be a
    /// prefix of the other.
    pub fn owns_container(&self, container_id: &str) -> bool {
        match self {
            Self::Container { container_id: ours, .. } => {
                !ours.is_empty()
                    && !container_id.is_empty()
                    && (ours.starts_with(container_id) || container_id.starts_with(ours.as_str()))
            }
            _ => false,
        }
    }

    /// Host directory the task works in (`None` inside a container)
    pub fn host_path(&self) -> Option<&Path> {
        match self {
            Self::Container { .. } => None,
            Self::Worktree { path, .. }
            | Self::Directory { path, .. }
            | Self::Passthrough { path, .. } => Some(path),
        }
    }
}

// ============================================================================
// Provider trait
// ============================================================================

/// One isolation strategy
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    fn strategy(&self) -> IsolationStrategy;

    async fn acquire(&self, task: &Task, overrides: &ExecutionOverrides) -> Result<WorkspaceHandle>;

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()>;

    /// Run `command` through `sh -c` inside the workspace
    async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput>;
}

/// `sh -c <command>` in a host directory
pub(crate) async fn exec_on_host(
    runner: &dyn CommandRunner,
    dir: &Path,
    command: &str,
) -> Result<CommandOutput> {
    let spec = CommandSpec::new("sh").args(["-c", command]).cwd(dir);
    runner
        .run(&spec)
        .await
        .map_err(|e| Error::Workspace(e.to_string()))
}

pub(crate) fn handle_mismatch(expected: IsolationStrategy, handle: &WorkspaceHandle) -> Error {
    Error::Workspace(format!(
        "{} provider cannot use a {} handle",
        expected,
        handle.strategy()
    ))
}

// ============================================================================
// Manager
// ============================================================================

/// Dispatches to the provider of the selected strategy
#[derive(Clone)]
pub struct WorkspaceManager {
    providers: HashMap<IsolationStrategy, Arc<dyn WorkspaceProvider>>,
    default_strategy: IsolationStrategy,
}

impl WorkspaceManager {
    /// All four strategies, configured from `config`
    pub fn new(
        config: &ApexConfig,
        containers: Arc<ContainerManager>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let root = config.workspace.resolve_root_dir();

        Self::empty(config.workspace.default_strategy)
            .with_provider(Arc::new(ContainerWorkspace::new(
                containers,
                config.clone(),
            )))
            .with_provider(Arc::new(WorktreeWorkspace::new(runner.clone(), &root)))
            .with_provider(Arc::new(DirectoryWorkspace::new(runner.clone(), &root)))
            .with_provider(Arc::new(PassthroughWorkspace::new(runner)))
    }

    /// No providers registered
    pub fn empty(default_strategy: IsolationStrategy) -> Self {
        Self {
            providers: HashMap::new(),
            default_strategy,
        }
    }

    /// Register (or replace) the provider for its strategy
    pub fn with_provider(mut self, provider: Arc<dyn WorkspaceProvider>) -> Self {
        self.providers.insert(provider.strategy(), provider);
        self
    }

    pub fn default_strategy(&self) -> IsolationStrategy {
        self.default_strategy
    }

    /// Per-invocation override, else the configured default
    pub fn resolve_strategy(&self, overrides: &ExecutionOverrides) -> IsolationStrategy {
        overrides.strategy.unwrap_or(self.default_strategy)
    }

    pub fn provider(&self, strategy: IsolationStrategy) -> Result<Arc<dyn WorkspaceProvider>> {
        self.providers
            .get(&strategy)
            .cloned()
            .ok_or_else(|| Error::Workspace(format!("No provider for strategy: {}", strategy)))
    }

    pub async fn acquire(
        &self,
        task: &Task,
        overrides: &ExecutionOverrides,
    ) -> Result<WorkspaceHandle> {
        let strategy = self.resolve_strategy(overrides);
        debug!(task_id = %task.id, strategy = %strategy, "Acquiring workspace");

        let handle = self.provider(strategy)?.acquire(task, overrides).await?;
        info!(task_id = %task.id, strategy = %strategy, location = %handle.location(), "Workspace acquired");
        Ok(handle)
    }

    pub async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        self.provider(handle.strategy())?.release(handle).await?;
        info!(task_id = %handle.task_id(), strategy = %handle.strategy(), "Workspace released");
        Ok(())
    }

    pub async fn exec_in(&self, handle: &WorkspaceHandle, command: &str) -> Result<CommandOutput> {
        self.provider(handle.strategy())?.exec_in(handle, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_accessors() {
        let handle = WorkspaceHandle::Container {
            task_id: "t1".to_string(),
            container_id: "abc".to_string(),
            name: "apex-task-t1".to_string(),
        };
        assert_eq!(handle.strategy(), IsolationStrategy::Container);
        assert_eq!(handle.task_id(), "t1");
        assert_eq!(handle.location(), "abc");
        assert!(handle.host_path().is_none());

        let handle = WorkspaceHandle::Passthrough {
            task_id: "t2".to_string(),
            path: PathBuf::from("/repo"),
        };
        assert_eq!(handle.strategy(), IsolationStrategy::None);
        assert_eq!(handle.host_path(), Some(Path::new("/repo")));
    }

    #[test]
    fn test_owns_container() {
        let handle = WorkspaceHandle::Container {
            task_id: "t1".to_string(),
            container_id: "c0ffee000000aaaabbbb".to_string(),
            name: "apex-task-t1".to_string(),
        };
        assert!(handle.owns_container("c0ffee000000aaaabbbb"));
        assert!(handle.owns_container("c0ffee000000"));
        assert!(!handle.owns_container("leftover999"));
        assert!(!handle.owns_container(""));

        let handle = WorkspaceHandle::Directory {
            task_id: "t1".to_string(),
            path: PathBuf::from("/tmp/t1"),
        };
        assert!(!handle.owns_container("c0ffee000000"));
    }

    #[test]
    fn test_handle_serde_tag() {
        let handle = WorkspaceHandle::Passthrough {
            task_id: "t2".to_string(),
            path: PathBuf::from("/repo"),
        };
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["strategy"], "none");

        let back: WorkspaceHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn test_resolve_strategy_and_missing_provider() {
        let manager = WorkspaceManager::empty(IsolationStrategy::Directory);
        assert_eq!(
            manager.resolve_strategy(&ExecutionOverrides::new()),
            IsolationStrategy::Directory
        );
        assert_eq!(
            manager.resolve_strategy(&ExecutionOverrides::new().strategy(IsolationStrategy::None)),
            IsolationStrategy::None
        );
        assert!(matches!(
            manager.provider(IsolationStrategy::Container),
            Err(Error::Workspace(_))
        ));
    }
}
