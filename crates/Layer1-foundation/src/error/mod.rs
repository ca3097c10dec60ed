//! Error types for Apex
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Apex 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 컨테이너 런타임 관련
    // ========================================================================
    #[error("No usable container runtime: {0}")]
    RuntimeUnavailable(String),

    #[error("Container {operation} failed: {message}")]
    ContainerOperation { operation: String, message: String },

    #[error("Malformed event: {0}")]
    EventStream(String),

    // ========================================================================
    // Task 관련
    // ========================================================================
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateId(String),

    #[error("Task {task_id} is blocked by unfinished dependencies: {}", blocked_by.join(", "))]
    DependencyUnmet {
        task_id: String,
        blocked_by: Vec<String>,
    },

    #[error("Task {task_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryExhausted {
        task_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Illegal status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ContainerOperation { .. } | Error::Workspace(_)
        )
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::RuntimeUnavailable(_)
                | Error::TaskNotFound(_)
                | Error::DuplicateId(_)
                | Error::DependencyUnmet { .. }
                | Error::RetryExhausted { .. }
                | Error::InvalidTransition { .. }
                | Error::Validation(_)
                | Error::Cancelled
        )
    }

    /// 컨테이너 작업 에러 생성 헬퍼
    pub fn container(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ContainerOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// 상태 전이 에러 생성 헬퍼
    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_message_lists_blockers() {
        let err = Error::DependencyUnmet {
            task_id: "t2".to_string(),
            blocked_by: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Task t2 is blocked by unfinished dependencies: a, b"
        );
        assert!(err.is_user_facing());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_container_helper() {
        let err = Error::container("start", "no such image");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Container start failed: no such image");
    }
}
