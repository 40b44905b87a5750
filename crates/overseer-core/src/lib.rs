//! Core types and error definitions for the Overseer task orchestrator.
//!
//! This crate provides the foundational types shared across all Overseer crates:
//! the task record and its lifecycle state machine, worker records, dead-letter
//! entries, approval requests, scheduled definitions, cost allocations and
//! escalations. It performs no I/O.
//!
//! # Main types
//!
//! - [`OverseerError`]: Unified error enum for all Overseer subsystems.
//! - [`OverseerResult`]: Convenience alias for `Result<T, OverseerError>`.
//! - [`Task`]: A unit of work in the shared queue.
//! - [`TaskStatus`]: Lifecycle state, validated by [`state_machine::validate`].
//! - [`WorkerRecord`]: A registered worker and its heartbeat state.
//! - [`DeadLetterEntry`]: A task parked after exhausting its retry budget.
//! - [`ApprovalRequest`]: Human sign-off gate for risky tasks.

/// Approval requests, decisions and risk levels.
pub mod approval;
/// Cost allocations, budget periods and limits.
pub mod budget;
/// Dead-letter entries.
pub mod dead_letter;
/// Escalation records and severities.
pub mod escalation;
/// Failure fingerprinting.
pub mod fingerprint;
/// Retry and lifecycle history entries.
pub mod history;
/// Recurring task definitions.
pub mod schedule;
/// Task lifecycle transition table.
pub mod state_machine;
/// Task records, priorities and statuses.
pub mod task;
/// Worker records.
pub mod worker;

pub use approval::{ApprovalDecision, ApprovalRequest, RiskLevel};
pub use budget::{
    AllocationStatus, BudgetLimits, BudgetPeriod, BudgetScope, BudgetUsage, ResourceAllocation,
};
pub use dead_letter::{DeadLetterEntry, DeadLetterStatus};
pub use escalation::{Escalation, EscalationStatus, Severity};
pub use fingerprint::fingerprint;
pub use history::{HistoryEntry, HistoryEvent};
pub use schedule::{Recurrence, ScheduledTaskDefinition};
pub use task::{BlockReason, Priority, Task, TaskStatus, DEFAULT_MAX_ATTEMPTS};
pub use worker::{capability_matches, WorkerRecord, WorkerStatus, ANY_CAPABILITY};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Overseer orchestrator.
///
/// Variants are grouped so that callers (and the operator CLI) can tell
/// "not found", "conflicting state" and "validation failure" apart; see
/// [`OverseerError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum OverseerError {
    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The record exists but is not in the state the caller expected
    /// (for example, another worker won the claim race).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request itself is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A status change that is not in the lifecycle transition table.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task the transition was requested for.
        task_id: Uuid,
        /// Status the caller believed the task was in.
        from: TaskStatus,
        /// Status the caller asked for.
        to: TaskStatus,
    },

    /// The durable store failed or is unreachable.
    #[error("Store error: {0}")]
    Store(String),

    /// A task handler could not be resolved or misbehaved.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A budget could not be evaluated or was misconfigured.
    #[error("Budget error: {0}")]
    Budget(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`OverseerError`].
pub type OverseerResult<T> = Result<T, OverseerError>;

/// Coarse classification of an [`OverseerError`], used for operator-facing
/// response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced record does not exist.
    NotFound,
    /// The record is in a conflicting state.
    Conflict,
    /// The request was rejected as invalid.
    Validation,
    /// Anything else.
    Internal,
}

impl OverseerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OverseerError::NotFound(_) => ErrorKind::NotFound,
            OverseerError::Conflict(_) => ErrorKind::Conflict,
            OverseerError::Validation(_)
            | OverseerError::InvalidTransition { .. }
            | OverseerError::Config(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }

    /// Process exit code for the operator CLI.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound => 3,
            ErrorKind::Conflict => 4,
            ErrorKind::Validation => 5,
            ErrorKind::Internal => 1,
        }
    }

    /// Whether this error means the store could not answer.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, OverseerError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(OverseerError::NotFound("t".into()).kind(), ErrorKind::NotFound);
        assert_eq!(OverseerError::Conflict("t".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            OverseerError::InvalidTransition {
                task_id: Uuid::nil(),
                from: TaskStatus::Completed,
                to: TaskStatus::Pending,
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(OverseerError::Store("down".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            OverseerError::NotFound(String::new()).exit_code(),
            OverseerError::Conflict(String::new()).exit_code(),
            OverseerError::Validation(String::new()).exit_code(),
            OverseerError::Store(String::new()).exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = OverseerError::InvalidTransition {
            task_id: Uuid::nil(),
            from: TaskStatus::Completed,
            to: TaskStatus::InProgress,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed -> in_progress"), "got: {msg}");
    }
}
