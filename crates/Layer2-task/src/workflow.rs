//! Workflow collaborator interfaces
//!
//! The engine does not know what a stage *does*. It asks a [`WorkflowCatalog`]
//! which stages a workflow has and hands each one to a [`StageRunner`]
//! (the agent/LLM side) together with the task's workspace.

use crate::process::CommandOutput;
use crate::workspace::{WorkspaceHandle, WorkspaceManager};
use apex_foundation::{Error, Result, Task, TaskUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub name: String,
    /// Agent that performs the stage
    pub agent: String,
    #[serde(default)]
    pub description: String,
    /// Pause for approval after this stage (supervised autonomy)
    #[serde(default)]
    pub requires_approval: bool,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            description: String::new(),
            requires_approval: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Source of workflow definitions
pub trait WorkflowCatalog: Send + Sync {
    /// Stages of `workflow`, `None` if unknown
    fn stages(&self, workflow: &str) -> Option<Vec<StageDefinition>>;

    fn has_agent(&self, _agent: &str) -> bool {
        true
    }

    /// Known, non-empty workflow whose agents all exist
    fn resolve(&self, workflow: &str) -> Result<Vec<StageDefinition>> {
        let stages = self
            .stages(workflow)
            .ok_or_else(|| Error::Workflow(format!("Unknown workflow: {}", workflow)))?;

        if stages.is_empty() {
            return Err(Error::Workflow(format!("Workflow has no stages: {}", workflow)));
        }
        if let Some(stage) = stages.iter().find(|s| !self.has_agent(&s.agent)) {
            return Err(Error::Workflow(format!(
                "Unknown agent '{}' in stage '{}' of workflow {}",
                stage.agent, stage.name, workflow
            )));
        }
        Ok(stages)
    }
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticWorkflowCatalog {
    workflows: HashMap<String, Vec<StageDefinition>>,
    // None: every agent is accepted
    agents: Option<HashSet<String>>,
}

impl StaticWorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        self.workflows.insert(name.into(), stages);
        self
    }

    /// Restrict the set of known agents
    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }
}

impl WorkflowCatalog for StaticWorkflowCatalog {
    fn stages(&self, workflow: &str) -> Option<Vec<StageDefinition>> {
        self.workflows.get(workflow).cloned()
    }

    fn has_agent(&self, agent: &str) -> bool {
        self.agents.as_ref().map_or(true, |known| known.contains(agent))
    }
}

/// What one stage produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    /// Usage of this stage alone (the orchestrator accumulates)
    pub usage: TaskUsage,
    pub logs: Vec<String>,
    pub artifacts: Vec<String>,
    /// Ask for approval even when the stage definition does not
    pub needs_approval: bool,
}

impl StageOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, usage: TaskUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn artifact(mut self, path: impl Into<String>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn needs_approval(mut self) -> Self {
        self.needs_approval = true;
        self
    }
}

/// Everything a stage runner gets to work with
pub struct StageContext<'a> {
    pub task: &'a Task,
    pub stage: &'a StageDefinition,
    pub stage_index: usize,
    pub workspace: &'a WorkspaceHandle,
    pub workspaces: &'a WorkspaceManager,
    /// Cancelled on cancel/pause/container death
    pub cancel: CancellationToken,
}

impl StageContext<'_> {
    /// `sh -c <command>` inside the task's workspace
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.workspaces.exec_in(self.workspace, command).await
    }
}

/// Performs stage work (agent / LLM side)
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, ctx: StageContext<'_>) -> Result<StageOutcome>;
}
