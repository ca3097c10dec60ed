//! Task record types
//!
//! TaskStore에 저장되고 Orchestrator가 갱신하는 Task 레코드 정의

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Created, not yet submitted for execution
    Pending,
    /// Waiting for a concurrency slot or for dependencies
    Queued,
    /// Workspace is being prepared
    Planning,
    /// Workflow stages are running
    InProgress,
    /// A stage finished and a human must approve before continuing
    WaitingApproval,
    /// Suspended by the user
    Paused,
    /// All stages finished
    Completed,
    /// A stage, the workspace or the container failed
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Planning,
        TaskStatus::InProgress,
        TaskStatus::WaitingApproval,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::InProgress => "in-progress",
            Self::WaitingApproval => "waiting-approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further transition happens on its own (failed only leaves through a retry)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Holds (or is about to hold) a workspace
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::InProgress | Self::WaitingApproval | Self::Paused
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown task status: {}", s)))
    }
}

/// How much human approval a task's execution requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// Approval after every stage
    Manual,
    /// Approval only when a stage asks for it
    #[default]
    Supervised,
    /// Never stops for approval
    Autonomous,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Supervised => "supervised",
            Self::Autonomous => "autonomous",
        }
    }
}

impl FromStr for AutonomyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "supervised" => Ok(Self::Supervised),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(Error::Validation(format!("Unknown autonomy level: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(Error::Validation(format!("Unknown priority: {}", other))),
        }
    }
}

/// Workspace isolation mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationStrategy {
    /// Dedicated container per task
    Container,
    /// Git worktree on a task branch
    #[default]
    Worktree,
    /// Plain copy of the project directory
    Directory,
    /// No isolation: runs directly in the project path (least safe)
    None,
}

impl IsolationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Worktree => "worktree",
            Self::Directory => "directory",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(Self::Container),
            "worktree" => Ok(Self::Worktree),
            "directory" => Ok(Self::Directory),
            "none" => Ok(Self::None),
            other => Err(Error::Config(format!("Unknown isolation strategy: {}", other))),
        }
    }
}

// ============================================================================
// Usage
// ============================================================================

/// Token and cost accounting for one task
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl TaskUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, estimated_cost: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost,
        }
    }

    /// Cumulative snapshot after adding a delta
    pub fn accumulate(&self, delta: &TaskUsage) -> TaskUsage {
        TaskUsage {
            input_tokens: self.input_tokens + delta.input_tokens,
            output_tokens: self.output_tokens + delta.output_tokens,
            total_tokens: self.total_tokens + delta.total_tokens,
            estimated_cost: self.estimated_cost + delta.estimated_cost,
        }
    }

    /// True if any field of `self` is below the same field of `previous`
    pub fn regresses_from(&self, previous: &TaskUsage) -> bool {
        self.input_tokens < previous.input_tokens
            || self.output_tokens < previous.output_tokens
            || self.total_tokens < previous.total_tokens
            || self.estimated_cost < previous.estimated_cost
    }
}

// ============================================================================
// Task
// ============================================================================

/// A unit of work driven through workflow stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    pub workflow: String,
    pub autonomy: AutonomyLevel,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub project_path: PathBuf,
    pub branch_name: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub depends_on: Vec<String>,
    pub blocked_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage: TaskUsage,
    pub logs: Vec<String>,
    pub artifacts: Vec<String>,
    /// Latest failure message
    pub last_error: Option<String>,
    /// Exit code reported by the last container death
    pub exit_code: Option<i64>,
    pub oom_killed: Option<bool>,
    /// Index of the next workflow stage to run
    pub current_stage: u32,
    pub workspace_strategy: Option<IsolationStrategy>,
}

impl Task {
    /// Build a fresh `pending` record from a creation spec
    pub fn from_spec(spec: TaskSpec) -> Self {
        let id = spec.id.unwrap_or_else(generate_task_id);
        let branch_name = spec
            .branch_name
            .unwrap_or_else(|| format!("apex/{}", id));
        let now = Utc::now();

        let mut depends_on: Vec<String> = Vec::with_capacity(spec.depends_on.len());
        for dep in spec.depends_on {
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        Self {
            id,
            description: spec.description,
            workflow: spec.workflow,
            autonomy: spec.autonomy,
            status: TaskStatus::Pending,
            priority: spec.priority,
            project_path: spec.project_path,
            branch_name,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(0),
            depends_on,
            blocked_by: Vec::new(),
            created_at: now,
            updated_at: now,
            usage: TaskUsage::default(),
            logs: Vec::new(),
            artifacts: Vec::new(),
            last_error: None,
            exit_code: None,
            oom_killed: None,
            current_stage: 0,
            workspace_strategy: None,
        }
    }

    /// Merge a partial update into this record, rejecting inconsistent results.
    ///
    /// `updated_at` is left to the caller.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<()> {
        if let Some(usage) = &update.usage {
            if usage.regresses_from(&self.usage) {
                return Err(Error::Validation(format!(
                    "Usage for task {} may not decrease ({:?} -> {:?})",
                    self.id, self.usage, usage
                )));
            }
        }

        let retry_count = update.retry_count.unwrap_or(self.retry_count);
        let max_retries = update.max_retries.unwrap_or(self.max_retries);
        if retry_count > max_retries {
            return Err(Error::Validation(format!(
                "retryCount {} exceeds maxRetries {} for task {}",
                retry_count, max_retries, self.id
            )));
        }

        if let Some(usage) = update.usage {
            self.usage = usage;
        }
        self.retry_count = retry_count;
        self.max_retries = max_retries;

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(branch_name) = update.branch_name {
            self.branch_name = branch_name;
        }
        if let Some(depends_on) = update.depends_on {
            self.depends_on = depends_on;
        }
        if let Some(blocked_by) = update.blocked_by {
            self.blocked_by = blocked_by;
        }
        if let Some(last_error) = update.last_error {
            self.last_error = last_error;
        }
        if let Some(exit_code) = update.exit_code {
            self.exit_code = exit_code;
        }
        if let Some(oom_killed) = update.oom_killed {
            self.oom_killed = oom_killed;
        }
        if let Some(current_stage) = update.current_stage {
            self.current_stage = current_stage;
        }
        if let Some(strategy) = update.workspace_strategy {
            self.workspace_strategy = strategy;
        }

        self.logs.extend(update.append_logs);
        self.artifacts.extend(update.append_artifacts);
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Generate a short random task identifier
pub fn generate_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Input for creating a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Explicit id (generated if absent)
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub workflow: String,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub priority: TaskPriority,
    pub project_path: PathBuf,
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Retry budget (the orchestrator fills in its configured default)
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskSpec {
    pub fn new(
        description: impl Into<String>,
        workflow: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            description: description.into(),
            workflow: workflow.into(),
            project_path: project_path.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_autonomy(mut self, autonomy: AutonomyLevel) -> Self {
        self.autonomy = autonomy;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }
}

/// Partial update merged by `TaskStore::update_task`.
///
/// Optional fields replace stored values; logs and artifacts are appended.
/// `Option<Option<_>>` fields distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub branch_name: Option<String>,
    pub retry_count: Option<u32>,
    pub max_retries: Option<u32>,
    pub depends_on: Option<Vec<String>>,
    pub blocked_by: Option<Vec<String>>,
    pub usage: Option<TaskUsage>,
    pub append_logs: Vec<String>,
    pub append_artifacts: Vec<String>,
    pub last_error: Option<Option<String>>,
    pub exit_code: Option<Option<i64>>,
    pub oom_killed: Option<Option<bool>>,
    pub current_stage: Option<u32>,
    pub workspace_strategy: Option<Option<IsolationStrategy>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn usage(mut self, usage: TaskUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn blocked_by(mut self, blocked_by: Vec<String>) -> Self {
        self.blocked_by = Some(blocked_by);
        self
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.append_logs.push(line.into());
        self
    }

    pub fn logs(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.append_logs.extend(lines);
        self
    }

    pub fn artifacts(mut self, artifacts: impl IntoIterator<Item = String>) -> Self {
        self.append_artifacts.extend(artifacts);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn container_exit(mut self, exit_code: Option<i64>, oom_killed: bool) -> Self {
        self.exit_code = Some(exit_code);
        self.oom_killed = Some(Some(oom_killed));
        self
    }

    pub fn current_stage(mut self, stage: u32) -> Self {
        self.current_stage = Some(stage);
        self
    }

    pub fn workspace_strategy(mut self, strategy: IsolationStrategy) -> Self {
        self.workspace_strategy = Some(Some(strategy));
        self
    }
}

/// Query for `TaskStore::list_tasks`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&TaskStatus::WaitingApproval).unwrap(),
            "\"waiting-approval\""
        );
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_spec_dedups_dependencies() {
        let task = Task::from_spec(
            TaskSpec::new("fix bug", "feature", "/tmp/p")
                .depends_on("a")
                .depends_on("b")
                .depends_on("a"),
        );
        assert_eq!(task.depends_on, vec!["a", "b"]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.branch_name, format!("apex/{}", task.id));
        assert_eq!(task.id.len(), 12);
    }

    #[test]
    fn test_apply_rejects_usage_regression() {
        let mut task = Task::from_spec(TaskSpec::new("t", "w", "/p"));
        task.apply(TaskUpdate::new().usage(TaskUsage::new(1000, 500, 0.015)))
            .unwrap();

        let err = task
            .apply(TaskUpdate::new().usage(TaskUsage::new(900, 500, 0.015)))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(task.usage.input_tokens, 1000);
    }

    #[test]
    fn test_apply_rejects_retry_overflow() {
        let mut task = Task::from_spec(TaskSpec::new("t", "w", "/p").with_max_retries(1));
        assert!(task.apply(TaskUpdate::new().retry_count(1)).is_ok());
        assert!(task.apply(TaskUpdate::new().retry_count(2)).is_err());
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_apply_appends_logs() {
        let mut task = Task::from_spec(TaskSpec::new("t", "w", "/p"));
        task.apply(TaskUpdate::new().log("one")).unwrap();
        task.apply(TaskUpdate::new().log("two").error("boom")).unwrap();
        assert_eq!(task.logs, vec!["one", "two"]);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_usage_accumulate() {
        let total = TaskUsage::new(10, 5, 0.1).accumulate(&TaskUsage::new(1, 2, 0.05));
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.total_tokens, 18);
        assert!(!total.regresses_from(&TaskUsage::new(10, 5, 0.1)));
    }
}
