//! Storage module for Apex
//!
//! - `db`: SQLite - Task 레코드 (영속, 트랜잭션 업데이트)
//! - `json`: JSON - 설정 파일 저장/로드

mod db;
mod json;

// SQLite Task Store
pub use db::{TaskStore, TASK_DB_FILE};

// JSON Storage (설정)
pub use json::JsonStore;
