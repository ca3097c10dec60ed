//! Task state machine
//!
//! ```text
//! pending ─▶ queued ─▶ planning ─▶ in-progress ─▶ completed
//!              ▲                     │  ▲  ▲
//!              │          ┌──────────┘  │  └──────────┐
//!              │          ▼             │             ▼
//!              │   waiting-approval ────┘          paused
//!              │
//!            failed ◀── planning / in-progress
//!
//! cancelled ◀── every status except completed / cancelled
//! ```
//!
//! Every status change goes through [`validate_transition`]; nothing else
//! may write `Task::status`.

use apex_foundation::{Error, Result, TaskStatus};

/// Legal targets from `from`
pub fn allowed_targets(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;

    match from {
        Pending => &[Queued, Cancelled],
        Queued => &[Planning, Cancelled],
        Planning => &[InProgress, Failed, Cancelled],
        InProgress => &[Completed, Failed, WaitingApproval, Paused, Cancelled],
        WaitingApproval => &[InProgress, Cancelled],
        Paused => &[InProgress, Cancelled],
        // leaves only through a retry (or is abandoned while a retry is pending)
        Failed => &[Queued, Cancelled],
        Completed | Cancelled => &[],
    }
}

pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    allowed_targets(from).contains(&to)
}

pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::transition(from, to))
    }
}

/// `cancel` is a no-op on these
pub fn is_final(status: TaskStatus) -> bool {
    allowed_targets(status).is_empty()
}
