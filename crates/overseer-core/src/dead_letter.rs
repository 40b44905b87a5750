use crate::task::Task;
use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Operator-facing state of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for an operator.
    Pending,
    /// Requeued by an operator; the task is back in the queue.
    Retrying,
    /// Closed by an operator after handling it out of band.
    Resolved,
    /// Closed by an operator; the work is dropped.
    Abandoned,
}

impl DeadLetterStatus {
    /// Stored name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Abandoned => "abandoned",
        }
    }

    /// Resolved and abandoned entries accept no further operator action.
    pub fn is_closed(self) -> bool {
        matches!(self, DeadLetterStatus::Resolved | DeadLetterStatus::Abandoned)
    }
}

impl FromStr for DeadLetterStatus {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "retrying" => Ok(DeadLetterStatus::Retrying),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "abandoned" => Ok(DeadLetterStatus::Abandoned),
            other => Err(OverseerError::Validation(format!(
                "unknown dead-letter status '{other}'"
            ))),
        }
    }
}

/// A task parked after exhausting its retry budget. There is at most one
/// entry per task; repeated dead-lettering bumps `failure_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Parked task.
    pub task_id: Uuid,
    /// Full task as it was when it was dead-lettered.
    pub snapshot: Task,
    /// Last failure message.
    pub failure_reason: String,
    /// Fingerprint of the last failure.
    pub fingerprint: String,
    /// Times the task has been parked.
    pub failure_count: u32,
    /// Operator requeues performed so far.
    pub retry_count: u32,
    /// Attempt budget the task had when parked.
    pub max_retries: u32,
    /// Operator-facing state.
    pub status: DeadLetterStatus,
    /// Note left when the entry was closed.
    pub resolution_note: Option<String>,
    /// First time the task was parked.
    pub first_failed_at: DateTime<Utc>,
    /// Most recent time the task was parked.
    pub last_failure_at: DateTime<Utc>,
    /// Last change to the entry.
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Whether an operator may still requeue the task.
    pub fn can_requeue(&self) -> bool {
        !self.status.is_closed()
            && self.status != DeadLetterStatus::Retrying
            && self.retry_count < self.max_retries
    }
}
