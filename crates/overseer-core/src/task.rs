use crate::approval::RiskLevel;
use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Attempts granted to a task when the producer does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Scheduling priority. Lower [`Priority::rank`] is claimed first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Claimed before everything else.
    Critical,
    /// Ahead of routine work.
    High,
    /// Routine work.
    #[default]
    Normal,
    /// Behind routine work.
    Low,
    /// Only when nothing else is eligible.
    Deferred,
}

impl Priority {
    /// Sort rank used by candidate selection (0 = most urgent).
    pub fn rank(self) -> i64 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Deferred => 4,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            4 => Some(Priority::Deferred),
            _ => None,
        }
    }

    /// Lowercase priority name.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Deferred => "deferred",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "deferred" => Ok(Priority::Deferred),
            other => Err(OverseerError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Lifecycle state of a task. Allowed moves between states live in
/// [`crate::state_machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Held by a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Last attempt failed; claimable again if attempts remain.
    Failed,
    /// Parked until a reviewer decides.
    WaitingApproval,
    /// Held back by a dependency or budget gate.
    Blocked,
    /// Handler handed off; completion is reported externally.
    AwaitingExternalCompletion,
    /// Attempts exhausted; waiting for an operator.
    DeadLettered,
    /// Turned down at approval.
    Rejected,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::WaitingApproval,
        TaskStatus::Blocked,
        TaskStatus::AwaitingExternalCompletion,
        TaskStatus::DeadLettered,
        TaskStatus::Rejected,
    ];

    /// Stored name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Blocked => "blocked",
            TaskStatus::AwaitingExternalCompletion => "awaiting_external_completion",
            TaskStatus::DeadLettered => "dead_lettered",
            TaskStatus::Rejected => "rejected",
        }
    }

    /// Completed, dead-lettered and rejected tasks are never picked up again
    /// automatically.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::DeadLettered | TaskStatus::Rejected
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OverseerError::Validation(format!("unknown task status '{s}'")))
    }
}

/// Why a task sits in [`TaskStatus::Blocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    /// Denied by the budget enforcer; re-evaluated once usage resets.
    Budget,
    /// A dependency was not (or could not be shown to be) completed.
    Dependency,
}

impl BlockReason {
    /// Stored name of the reason.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::Budget => "budget",
            BlockReason::Dependency => "dependency",
        }
    }
}

impl FromStr for BlockReason {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "budget" => Ok(BlockReason::Budget),
            "dependency" => Ok(BlockReason::Dependency),
            other => Err(OverseerError::Validation(format!("unknown block reason '{other}'"))),
        }
    }
}

/// A unit of work in the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: Uuid,
    /// Discriminator used for handler lookup and capability matching.
    pub task_type: String,
    /// Short human-readable label.
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Opaque data handed to the handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Claim priority.
    pub priority: Priority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Worker currently holding the task.
    pub assigned_worker: Option<String>,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Attempts allowed before the task is dead-lettered.
    pub max_attempts: u32,
    /// Tasks that must be completed before this one may be claimed.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Cost reserved against budgets at claim time.
    pub estimated_cost: f64,
    /// Cost reported by the handler.
    pub actual_cost: Option<f64>,
    /// Needs sign-off regardless of risk.
    pub requires_approval: bool,
    /// Risk used by the approval gate.
    pub risk_level: RiskLevel,
    /// Evidence recorded at completion.
    pub completion_evidence: Option<serde_json::Value>,
    /// Last failure message.
    pub error_message: Option<String>,
    /// Why the task is blocked.
    pub block_reason: Option<BlockReason>,
    /// Earliest time the task may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,
    /// Worker that last failed this task; kept away from it until `avoid_until`.
    pub avoid_worker: Option<String>,
    /// End of the avoid window.
    pub avoid_until: Option<DateTime<Utc>>,
    /// Worker that most recently held the task, kept after the assignment is cleared.
    pub last_worker: Option<String>,
    /// Scheduled definition that generated this task, if any.
    pub schedule_name: Option<String>,
    /// Idempotency key for producers that may insert the same work twice.
    pub dedupe_key: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Most recent claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Pending task with default priority and attempts.
    pub fn new(task_type: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            title: title.into(),
            description: String::new(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            assigned_worker: None,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            depends_on: Vec::new(),
            estimated_cost: 0.0,
            actual_cost: None,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            completion_evidence: None,
            error_message: None,
            block_reason: None,
            available_at: now,
            avoid_worker: None,
            avoid_until: None,
            last_worker: None,
            schedule_name: None,
            dedupe_key: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the tasks this one waits on.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Sets the cost reserved at claim time.
    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    /// Flags the task for sign-off at `risk_level`.
    pub fn with_approval(mut self, risk_level: RiskLevel) -> Self {
        self.requires_approval = true;
        self.risk_level = risk_level;
        self
    }

    /// Sets the risk without flagging it.
    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Sets the idempotency key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Whether attempts remain before the task must be dead-lettered.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Check the invariants a producer-supplied task must satisfy before it
    /// is inserted.
    pub fn validate_new(&self) -> Result<(), OverseerError> {
        if self.task_type.trim().is_empty() {
            return Err(OverseerError::Validation("task type must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(OverseerError::Validation("max_attempts must be at least 1".into()));
        }
        if !self.estimated_cost.is_finite() || self.estimated_cost < 0.0 {
            return Err(OverseerError::Validation(format!(
                "estimated_cost must be a non-negative number, got {}",
                self.estimated_cost
            )));
        }
        if self.depends_on.contains(&self.id) {
            return Err(OverseerError::Validation(format!(
                "task {} cannot depend on itself",
                self.id
            )));
        }
        if self.status != TaskStatus::Pending {
            return Err(OverseerError::Validation(format!(
                "new tasks must start pending, got {}",
                self.status
            )));
        }
        Ok(())
    }
}
