//! SQLite Task Store
//!
//! Task 레코드의 영속 저장소:
//! - 배열/객체 필드 (dependsOn, blockedBy, usage, logs, artifacts)는 JSON으로 저장
//! - 시각은 나노초 정밀도의 RFC 3339 문자열로 저장 (재시작 후에도 동일한 값)
//! - 업데이트는 트랜잭션 단위 (read → merge → validate → write)
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Initial schema (tasks)
//! - Version 2: Failure details, stage cursor and workspace strategy columns

use crate::core::{Task, TaskFilter, TaskSpec, TaskStatus, TaskUpdate, TaskUsage};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Database file name inside the data directory
pub const TASK_DB_FILE: &str = "apex.db";

const TASK_COLUMNS: &str = r#"
    id, description, workflow, autonomy, status, priority, project_path, branch_name,
    retry_count, max_retries, depends_on, blocked_by, usage, logs, artifacts,
    created_at, updated_at, last_error, exit_code, oom_killed, current_stage,
    workspace_strategy
"#;

/// Durable store for task records
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl TaskStore {
    /// Open (or create) the store inside `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(TASK_DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path),
        };

        store.initialize_schema()?;
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };

        store.initialize_schema()?;
        store.run_migrations()?;

        Ok(store)
    }

    /// Database file path (None when in memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Tasks table
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                workflow TEXT NOT NULL,
                autonomy TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending', 'queued', 'planning', 'in-progress',
                    'waiting-approval', 'paused', 'completed', 'failed', 'cancelled')),
                priority TEXT NOT NULL,
                project_path TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                depends_on TEXT NOT NULL DEFAULT '[]',
                blocked_by TEXT NOT NULL DEFAULT '[]',
                usage TEXT NOT NULL,
                logs TEXT NOT NULL DEFAULT '[]',
                artifacts TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK(retry_count <= max_retries)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status
                ON tasks(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_created
                ON tasks(created_at);

            -- Insert initial schema version if not exists
            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running database migrations from version {} to {}",
            current_version, CURRENT_SCHEMA_VERSION
        );

        let conn = self.lock()?;

        for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
            match version {
                2 => Self::migrate_v2(&conn)?,
                _ => {
                    warn!("Unknown migration version: {}", version);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| Error::Storage(format!("Failed to record migration: {}", e)))?;

            info!("Applied migration to version {}", version);
        }

        Ok(())
    }

    /// Migration to version 2: failure details and resume cursor
    fn migrate_v2(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            ALTER TABLE tasks ADD COLUMN last_error TEXT;
            ALTER TABLE tasks ADD COLUMN exit_code INTEGER;
            ALTER TABLE tasks ADD COLUMN oom_killed INTEGER;
            ALTER TABLE tasks ADD COLUMN current_stage INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE tasks ADD COLUMN workspace_strategy TEXT;
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to migrate to version 2: {}", e)))
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create a task in `pending` status
    pub fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        let task = Task::from_spec(spec);
        self.insert_task(&task)?;
        Ok(task)
    }

    /// Insert a fully-formed record (fails on duplicate id)
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        if task.retry_count > task.max_retries {
            return Err(Error::Validation(format!(
                "retryCount {} exceeds maxRetries {} for task {}",
                task.retry_count, task.max_retries, task.id
            )));
        }

        let conn = self.lock()?;

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                params![task.id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("Failed to check task id: {}", e)))?;
        if exists {
            return Err(Error::DuplicateId(task.id.clone()));
        }

        let row = TaskRow::from_task(task)?;
        conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                TASK_COLUMNS
            ),
            params![
                row.id,
                row.description,
                row.workflow,
                row.autonomy,
                row.status,
                row.priority,
                row.project_path,
                row.branch_name,
                row.retry_count,
                row.max_retries,
                row.depends_on,
                row.blocked_by,
                row.usage,
                row.logs,
                row.artifacts,
                row.created_at,
                row.updated_at,
                row.last_error,
                row.exit_code,
                row.oom_killed,
                row.current_stage,
                row.workspace_strategy,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to create task: {}", e)))?;

        debug!(task_id = %task.id, "Task persisted");
        Ok(())
    }

    /// Get a task by ID (None if it does not exist)
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        Self::select_task(&conn, id)
    }

    /// Merge a partial update into a stored task and bump `updated_at`
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        let mut task =
            Self::select_task(&tx, id)?.ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.apply(update)?;
        task.updated_at = Utc::now().max(task.updated_at);

        let row = TaskRow::from_task(&task)?;
        tx.execute(
            r#"
            UPDATE tasks SET
                description = ?2,
                status = ?3,
                priority = ?4,
                branch_name = ?5,
                retry_count = ?6,
                max_retries = ?7,
                depends_on = ?8,
                blocked_by = ?9,
                usage = ?10,
                logs = ?11,
                artifacts = ?12,
                updated_at = ?13,
                last_error = ?14,
                exit_code = ?15,
                oom_killed = ?16,
                current_stage = ?17,
                workspace_strategy = ?18
            WHERE id = ?1
            "#,
            params![
                row.id,
                row.description,
                row.status,
                row.priority,
                row.branch_name,
                row.retry_count,
                row.max_retries,
                row.depends_on,
                row.blocked_by,
                row.usage,
                row.logs,
                row.artifacts,
                row.updated_at,
                row.last_error,
                row.exit_code,
                row.oom_killed,
                row.current_stage,
                row.workspace_strategy,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to update task: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit task update: {}", e)))?;

        Ok(task)
    }

    /// List tasks ordered by creation time, most recent last
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.lock()?;

        let status = filter.status.map(|s| s.as_str());
        // SQLite treats a negative LIMIT as "no limit"
        let limit = filter.limit.map(|n| n as i64).unwrap_or(-1);

        let query = format!(
            r#"
            SELECT {cols} FROM (
                SELECT rowid AS seq, {cols} FROM tasks
                WHERE (?1 IS NULL OR status = ?1)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?2
            ) ORDER BY created_at ASC, seq ASC
            "#,
            cols = TASK_COLUMNS
        );

        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows: Vec<TaskRow> = stmt
            .query_map(params![status, limit], TaskRow::from_row)
            .map_err(|e| Error::Storage(format!("Failed to query tasks: {}", e)))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| Error::Storage(format!("Failed to read task row: {}", e)))?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Delete a task (not part of the normal lifecycle)
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;

        let removed = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("Failed to delete task: {}", e)))?;

        Ok(removed > 0)
    }

    /// Number of tasks per status
    pub fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let counts: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| Error::Storage(format!("Failed to count tasks: {}", e)))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| Error::Storage(format!("Failed to count tasks: {}", e)))?;

        counts
            .into_iter()
            .map(|(status, count)| Ok((status.parse()?, count as usize)))
            .collect()
    }

    fn select_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            TaskRow::from_row,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task: {}", e)))?
        .map(TaskRow::into_task)
        .transpose()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Column-level representation of a task
struct TaskRow {
    id: String,
    description: String,
    workflow: String,
    autonomy: String,
    status: String,
    priority: String,
    project_path: String,
    branch_name: String,
    retry_count: u32,
    max_retries: u32,
    depends_on: String,
    blocked_by: String,
    usage: String,
    logs: String,
    artifacts: String,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
    exit_code: Option<i64>,
    oom_killed: Option<bool>,
    current_stage: u32,
    workspace_strategy: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            description: row.get("description")?,
            workflow: row.get("workflow")?,
            autonomy: row.get("autonomy")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            project_path: row.get("project_path")?,
            branch_name: row.get("branch_name")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            depends_on: row.get("depends_on")?,
            blocked_by: row.get("blocked_by")?,
            usage: row.get("usage")?,
            logs: row.get("logs")?,
            artifacts: row.get("artifacts")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            last_error: row.get("last_error")?,
            exit_code: row.get("exit_code")?,
            oom_killed: row.get("oom_killed")?,
            current_stage: row.get("current_stage")?,
            workspace_strategy: row.get("workspace_strategy")?,
        })
    }

    fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.clone(),
            description: task.description.clone(),
            workflow: task.workflow.clone(),
            autonomy: task.autonomy.as_str().to_string(),
            status: task.status.as_str().to_string(),
            priority: task.priority.as_str().to_string(),
            project_path: task.project_path.to_string_lossy().to_string(),
            branch_name: task.branch_name.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            depends_on: serde_json::to_string(&task.depends_on)?,
            blocked_by: serde_json::to_string(&task.blocked_by)?,
            usage: serde_json::to_string(&task.usage)?,
            logs: serde_json::to_string(&task.logs)?,
            artifacts: serde_json::to_string(&task.artifacts)?,
            created_at: format_timestamp(&task.created_at),
            updated_at: format_timestamp(&task.updated_at),
            last_error: task.last_error.clone(),
            exit_code: task.exit_code,
            oom_killed: task.oom_killed,
            current_stage: task.current_stage,
            workspace_strategy: task.workspace_strategy.map(|s| s.as_str().to_string()),
        })
    }

    fn into_task(self) -> Result<Task> {
        let usage: TaskUsage = serde_json::from_str(&self.usage)?;

        Ok(Task {
            autonomy: self.autonomy.parse()?,
            status: self.status.parse()?,
            priority: self.priority.parse()?,
            project_path: PathBuf::from(self.project_path),
            depends_on: serde_json::from_str(&self.depends_on)?,
            blocked_by: serde_json::from_str(&self.blocked_by)?,
            usage,
            logs: serde_json::from_str(&self.logs)?,
            artifacts: serde_json::from_str(&self.artifacts)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            workspace_strategy: self
                .workspace_strategy
                .map(|s| s.parse())
                .transpose()?,
            id: self.id,
            description: self.description,
            workflow: self.workflow,
            branch_name: self.branch_name,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
            exit_code: self.exit_code,
            oom_killed: self.oom_killed,
            current_stage: self.current_stage,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AutonomyLevel, IsolationStrategy, TaskPriority};

    fn spec(id: &str) -> TaskSpec {
        TaskSpec::new(format!("task {}", id), "feature", "/work/project").with_id(id)
    }

    #[test]
    fn test_in_memory_store() {
        let store = TaskStore::in_memory().unwrap();
        assert_eq!(store.get_schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(store.path().is_none());
    }

    #[test]
    fn test_create_and_get() {
        let store = TaskStore::in_memory().unwrap();
        let created = store.create_task(spec("a")).unwrap();

        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(store.get_task("a").unwrap(), Some(created));
        assert_eq!(store.get_task("missing").unwrap(), None);
    }

    #[test]
    fn test_duplicate_id() {
        let store = TaskStore::in_memory().unwrap();
        store.create_task(spec("a")).unwrap();

        let err = store.create_task(spec("a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_update_unknown_task() {
        let store = TaskStore::in_memory().unwrap();
        let err = store
            .update_task("nope", TaskUpdate::new().status(TaskStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[test]
    fn test_update_bumps_updated_at() {
        let store = TaskStore::in_memory().unwrap();
        let created = store.create_task(spec("a")).unwrap();

        let updated = store
            .update_task("a", TaskUpdate::new().status(TaskStatus::Queued).log("queued"))
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Queued);
        assert_eq!(updated.logs, vec!["queued"]);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn test_usage_snapshot_replacement() {
        let store = TaskStore::in_memory().unwrap();
        store.create_task(spec("a")).unwrap();

        store
            .update_task("a", TaskUpdate::new().usage(TaskUsage::new(1000, 500, 0.015)))
            .unwrap();
        store
            .update_task("a", TaskUpdate::new().usage(TaskUsage::new(2000, 1000, 0.03)))
            .unwrap();

        let task = store.get_task("a").unwrap().unwrap();
        assert_eq!(
            task.usage,
            TaskUsage {
                input_tokens: 2000,
                output_tokens: 1000,
                total_tokens: 3000,
                estimated_cost: 0.03,
            }
        );
    }

    #[test]
    fn test_failed_update_leaves_record_untouched() {
        let store = TaskStore::in_memory().unwrap();
        store.create_task(spec("a").with_max_retries(1)).unwrap();

        let err = store
            .update_task("a", TaskUpdate::new().retry_count(2).log("should not land"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let task = store.get_task("a").unwrap().unwrap();
        assert_eq!(task.retry_count, 0);
        assert!(task.logs.is_empty());
    }

    #[test]
    fn test_list_order_filter_and_limit() {
        let store = TaskStore::in_memory().unwrap();
        for id in ["t1", "t2", "t3", "t4"] {
            store.create_task(spec(id)).unwrap();
        }
        store
            .update_task("t2", TaskUpdate::new().status(TaskStatus::Queued))
            .unwrap();
        store
            .update_task("t4", TaskUpdate::new().status(TaskStatus::Queued))
            .unwrap();

        let ids = |tasks: Vec<Task>| tasks.into_iter().map(|t| t.id).collect::<Vec<_>>();

        assert_eq!(
            ids(store.list_tasks(&TaskFilter::new()).unwrap()),
            vec!["t1", "t2", "t3", "t4"]
        );
        assert_eq!(
            ids(store
                .list_tasks(&TaskFilter::new().with_status(TaskStatus::Queued))
                .unwrap()),
            vec!["t2", "t4"]
        );
        assert_eq!(
            ids(store.list_tasks(&TaskFilter::new().with_limit(2)).unwrap()),
            vec!["t3", "t4"]
        );

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&2));
        assert_eq!(counts.get(&TaskStatus::Queued), Some(&2));
    }

    #[test]
    fn test_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let original = {
            let store = TaskStore::open(dir.path()).unwrap();
            store
                .create_task(
                    spec("persist")
                        .with_autonomy(AutonomyLevel::Manual)
                        .with_priority(TaskPriority::High)
                        .with_max_retries(3)
                        .depends_on("dep-1")
                        .depends_on("dep-2"),
                )
                .unwrap();

            let update = TaskUpdate::new()
                .status(TaskStatus::Failed)
                .usage(TaskUsage::new(1234, 567, 0.0421))
                .retry_count(2)
                .blocked_by(vec!["dep-2".to_string()])
                .log("stage plan finished")
                .log("container died: exit code 137 (SIGKILL), OOM killed")
                .artifacts(vec!["src/lib.rs".to_string()])
                .error("container died")
                .container_exit(Some(137), true)
                .current_stage(1)
                .workspace_strategy(IsolationStrategy::Container);
            store.update_task("persist", update).unwrap()
        };

        let reopened = TaskStore::open(dir.path()).unwrap();
        let loaded = reopened.get_task("persist").unwrap().unwrap();

        assert_eq!(loaded, original);
        assert_eq!(loaded.depends_on, vec!["dep-1", "dep-2"]);
        assert_eq!(loaded.created_at.timestamp_nanos_opt(), original.created_at.timestamp_nanos_opt());
        assert_eq!(reopened.get_schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_accumulated_cost_is_bit_exact_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = Vec::new();

        {
            let store = TaskStore::open(dir.path()).unwrap();
            for i in 0..300u64 {
                let id = format!("cost-{i}");
                store.create_task(spec(&id)).unwrap();

                // sums of small per-stage costs hit the last bits of the mantissa
                let mut usage = TaskUsage::default();
                for stage in 1..=(i % 7 + 2) {
                    let delta = TaskUsage::new(100 * stage, 50, (i + stage) as f64 / 9450.0 * 0.001);
                    usage = usage.accumulate(&delta);
                }
                store
                    .update_task(&id, TaskUpdate::new().usage(usage))
                    .unwrap();
                expected.push((id, usage));
            }
        }

        let reopened = TaskStore::open(dir.path()).unwrap();
        for (id, usage) in expected {
            let loaded = reopened.get_task(&id).unwrap().unwrap().usage;
            assert_eq!(
                loaded.estimated_cost.to_bits(),
                usage.estimated_cost.to_bits(),
                "{id}: {} != {}",
                loaded.estimated_cost,
                usage.estimated_cost
            );
            assert_eq!(loaded, usage);
        }
    }

    #[test]
    fn test_delete_task() {
        let store = TaskStore::in_memory().unwrap();
        store.create_task(spec("a")).unwrap();
        assert!(store.delete_task("a").unwrap());
        assert!(!store.delete_task("a").unwrap());
        assert!(store.get_task("a").unwrap().is_none());
    }
}
