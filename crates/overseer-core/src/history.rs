use crate::task::TaskStatus;
use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// What happened to a task. Every status change writes one history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Inserted into the queue.
    Submitted,
    /// Claimed by a worker.
    Claimed,
    /// Handed back by its worker without counting an attempt.
    Released,
    /// Finished successfully.
    Completed,
    /// An attempt failed.
    Failed,
    /// Queued again after backoff.
    RetryScheduled,
    /// Parked after exhausting its attempts.
    DeadLettered,
    /// Put back in the queue by an operator.
    Requeued,
    /// Parked until a reviewer decides.
    ApprovalRequested,
    /// Signed off by a reviewer or the expiry default.
    Approved,
    /// Turned down by a reviewer or the expiry default.
    Rejected,
    /// Held back by a gate.
    Blocked,
    /// Released from a block.
    Unblocked,
    /// Handler started work that finishes elsewhere.
    AwaitingExternal,
    /// Returned to the queue because its worker went silent.
    Reclaimed,
}

impl HistoryEvent {
    /// Stored name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryEvent::Submitted => "submitted",
            HistoryEvent::Claimed => "claimed",
            HistoryEvent::Released => "released",
            HistoryEvent::Completed => "completed",
            HistoryEvent::Failed => "failed",
            HistoryEvent::RetryScheduled => "retry_scheduled",
            HistoryEvent::DeadLettered => "dead_lettered",
            HistoryEvent::Requeued => "requeued",
            HistoryEvent::ApprovalRequested => "approval_requested",
            HistoryEvent::Approved => "approved",
            HistoryEvent::Rejected => "rejected",
            HistoryEvent::Blocked => "blocked",
            HistoryEvent::Unblocked => "unblocked",
            HistoryEvent::AwaitingExternal => "awaiting_external",
            HistoryEvent::Reclaimed => "reclaimed",
        }
    }
}

impl FromStr for HistoryEvent {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "submitted" => HistoryEvent::Submitted,
            "claimed" => HistoryEvent::Claimed,
            "released" => HistoryEvent::Released,
            "completed" => HistoryEvent::Completed,
            "failed" => HistoryEvent::Failed,
            "retry_scheduled" => HistoryEvent::RetryScheduled,
            "dead_lettered" => HistoryEvent::DeadLettered,
            "requeued" => HistoryEvent::Requeued,
            "approval_requested" => HistoryEvent::ApprovalRequested,
            "approved" => HistoryEvent::Approved,
            "rejected" => HistoryEvent::Rejected,
            "blocked" => HistoryEvent::Blocked,
            "unblocked" => HistoryEvent::Unblocked,
            "awaiting_external" => HistoryEvent::AwaitingExternal,
            "reclaimed" => HistoryEvent::Reclaimed,
            other => {
                return Err(OverseerError::Validation(format!("unknown history event '{other}'")))
            }
        };
        Ok(event)
    }
}

/// One row of the retry/lifecycle history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id, increasing per insert.
    pub id: i64,
    /// Task the event belongs to.
    pub task_id: Uuid,
    /// What happened.
    pub event: HistoryEvent,
    /// Status before the event.
    pub from_status: Option<TaskStatus>,
    /// Status after the event.
    pub to_status: Option<TaskStatus>,
    /// Worker or actor involved.
    pub worker_id: Option<String>,
    /// Free-form explanation.
    pub reason: Option<String>,
    /// Failure fingerprint, for failure events.
    pub fingerprint: Option<String>,
    /// When it happened.
    pub at: DateTime<Utc>,
}
