//! Durable storage for the Overseer orchestrator.
//!
//! Every collection sits behind its own narrow trait in [`store`]; the
//! [`SqliteStore`] implements all of them on one SQLite file that any number
//! of worker processes can share. Task status changes are validated against
//! the lifecycle table in `overseer_core::state_machine` before anything is
//! written.

/// Store-internal error type.
pub mod error;
/// SQLite implementation.
pub mod sqlite;
/// Store traits and request types.
pub mod store;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use store::{
    ApprovalStore, BudgetLedger, DeadLetterStore, EscalationStore, FailureRecord, InsertOutcome,
    RetryStep, ScheduleOutcome, ScheduleStore, TaskFilter, TaskStore, Transition, WorkerRegistry,
};
