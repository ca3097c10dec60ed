//! Core - 공통 도메인 타입
//!
//! - `task.rs` - Task 레코드, 상태, 사용량, 생성/갱신 스펙

pub mod task;

pub use task::{
    generate_task_id, AutonomyLevel, IsolationStrategy, Task, TaskFilter, TaskPriority, TaskSpec,
    TaskStatus, TaskUpdate, TaskUsage,
};
