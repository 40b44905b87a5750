//! The task lifecycle transition table.
//!
//! Every status change in the system is checked here before it is written.
//! A pair that is not listed is a defect signal: two code paths disagree
//! about the task's state. It is logged and rejected, never applied.

use crate::task::TaskStatus;
use crate::OverseerError;
use uuid::Uuid;

use TaskStatus::*;

/// Allowed `(from, to)` pairs.
pub const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    // claim
    (Pending, InProgress),
    (Failed, InProgress),
    // release and worker-offline reclaim
    (InProgress, Pending),
    // execution outcomes
    (InProgress, Completed),
    (InProgress, Failed),
    (InProgress, WaitingApproval),
    (InProgress, Blocked),
    (InProgress, AwaitingExternalCompletion),
    (AwaitingExternalCompletion, Completed),
    (AwaitingExternalCompletion, Failed),
    // retry / dead-letter
    (Failed, Pending),
    (Failed, DeadLettered),
    // approval
    (WaitingApproval, Pending),
    (WaitingApproval, InProgress),
    (WaitingApproval, Rejected),
    // unblock
    (Blocked, Pending),
    // operator requeue of a dead-letter entry
    (DeadLettered, Pending),
];

/// Whether `from -> to` is in the table.
pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Statuses reachable from `from`.
pub fn successors(from: TaskStatus) -> Vec<TaskStatus> {
    TRANSITIONS
        .iter()
        .filter(|(f, _)| *f == from)
        .map(|(_, t)| *t)
        .collect()
}

/// Validate a requested transition for `task_id`.
pub fn validate(task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<(), OverseerError> {
    if is_allowed(from, to) {
        return Ok(());
    }
    tracing::error!(
        task_id = %task_id,
        from = %from,
        to = %to,
        "Rejected invalid task transition"
    );
    Err(OverseerError::InvalidTransition { task_id, from, to })
}

/// Statuses a claim may originate from. `Failed` additionally requires
/// remaining attempts, which the store checks in its conditional update.
pub const CLAIMABLE: [TaskStatus; 2] = [Pending, Failed];
