use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Capability that lets a worker claim tasks of any type.
pub const ANY_CAPABILITY: &str = "*";

/// Liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Stopped or presumed dead.
    Offline,
    /// Idle and heartbeating.
    Active,
    /// Working on a task.
    Busy,
    /// Reported a fault.
    Error,
}

impl WorkerStatus {
    /// Stored name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Offline => "offline",
            WorkerStatus::Active => "active",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(WorkerStatus::Offline),
            "active" => Ok(WorkerStatus::Active),
            "busy" => Ok(WorkerStatus::Busy),
            "error" => Ok(WorkerStatus::Error),
            other => Err(OverseerError::Validation(format!("unknown worker status '{other}'"))),
        }
    }
}

/// A registered worker. `worker_id` is a logical identity that survives
/// process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Unique worker id.
    pub worker_id: String,
    /// Task types this worker may claim. `"*"` matches every type.
    pub capabilities: Vec<String>,
    /// Current liveness.
    pub status: WorkerStatus,
    /// Task it last reported holding.
    pub current_task: Option<Uuid>,
    /// Most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// True when the worker advertises `task_type` or `*`.
    pub fn can_handle(&self, task_type: &str) -> bool {
        capability_matches(&self.capabilities, task_type)
    }

    /// Heartbeat age at `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Whether a capability set admits `task_type`.
pub fn capability_matches(capabilities: &[String], task_type: &str) -> bool {
    capabilities
        .iter()
        .any(|c| c == ANY_CAPABILITY || c == task_type)
}
