//! Narrow store interfaces.
//!
//! Each durable collection gets its own trait so that orchestrator components
//! depend only on what they touch, and tests can swap a single collection for
//! a failing double. [`crate::SqliteStore`] implements all of them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{
    ApprovalDecision, ApprovalRequest, BlockReason, BudgetLimits, BudgetPeriod, BudgetScope,
    BudgetUsage, DeadLetterEntry, DeadLetterStatus, Escalation, EscalationStatus, HistoryEntry,
    HistoryEvent, OverseerResult, Priority, ResourceAllocation, ScheduledTaskDefinition, Task,
    TaskStatus, WorkerRecord,
};
use uuid::Uuid;

/// Result of inserting a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The task was written.
    Inserted,
    /// A task with the same dedupe key already exists; nothing was written.
    Duplicate,
}

/// Query filter for [`TaskStore::list_tasks`]. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only this status.
    pub status: Option<TaskStatus>,
    /// Only this priority.
    pub priority: Option<Priority>,
    /// Only this task type.
    pub task_type: Option<String>,
    /// Only tasks held by this worker.
    pub assigned_worker: Option<String>,
    /// Only tasks blocked for this reason.
    pub block_reason: Option<BlockReason>,
    /// Only tasks whose `started_at` is strictly earlier.
    pub started_before: Option<DateTime<Utc>>,
    /// Only tasks generated by this schedule.
    pub schedule_name: Option<String>,
    /// At most this many rows.
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Restricts to `status`.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to `priority`.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Restricts to tasks held by `worker_id`.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.assigned_worker = Some(worker_id.into());
        self
    }

    /// Restricts to tasks blocked for `reason`.
    pub fn with_block_reason(mut self, reason: BlockReason) -> Self {
        self.block_reason = Some(reason);
        self
    }

    /// Restricts to tasks started before `at`.
    pub fn started_before(mut self, at: DateTime<Utc>) -> Self {
        self.started_before = Some(at);
        self
    }

    /// Caps the number of rows.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A guarded status change of one task.
///
/// The store validates `from -> to` against the lifecycle table, applies the
/// update only if the task is still in `from` (and, when set, still assigned
/// to `expected_worker`), and writes one history row in the same transaction.
/// Assignment bookkeeping follows the target status: moving to `pending`,
/// `blocked`, `failed` or a terminal failure clears `assigned_worker`.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Task to move.
    pub task_id: Uuid,
    /// Status the task must currently have.
    pub from: TaskStatus,
    /// Status to move it to.
    pub to: TaskStatus,
    /// History event to record.
    pub event: HistoryEvent,
    /// When the change happens.
    pub at: DateTime<Utc>,
    /// Worker that must hold the task, if any.
    pub expected_worker: Option<String>,
    /// Worker recorded on the history row.
    pub actor: Option<String>,
    /// Explanation for the history row.
    pub reason: Option<String>,
    /// Failure fingerprint for the history row.
    pub fingerprint: Option<String>,
    /// Replaces the task's error message.
    pub error_message: Option<String>,
    /// Sets why the task is blocked.
    pub block_reason: Option<BlockReason>,
    /// Completion evidence to store.
    pub completion_evidence: Option<serde_json::Value>,
    /// Actual cost to store.
    pub actual_cost: Option<f64>,
    /// Counts one failed attempt.
    pub increment_attempts: bool,
    /// Zeroes the attempt counter.
    pub reset_attempts: bool,
    /// Delays the next claim until this time.
    pub available_at: Option<DateTime<Utc>>,
    /// Keeps the named worker away until the given time.
    pub avoid: Option<(String, DateTime<Utc>)>,
}

impl Transition {
    /// Transition from `from` to `to` recorded as `event`, happening now.
    pub fn new(task_id: Uuid, from: TaskStatus, to: TaskStatus, event: HistoryEvent) -> Self {
        Self {
            task_id,
            from,
            to,
            event,
            at: Utc::now(),
            expected_worker: None,
            actor: None,
            reason: None,
            fingerprint: None,
            error_message: None,
            block_reason: None,
            completion_evidence: None,
            actual_cost: None,
            increment_attempts: false,
            reset_attempts: false,
            available_at: None,
            avoid: None,
        }
    }

    /// Sets the time of the change.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// Only apply while the task is assigned to `worker_id`; also records it
    /// as the actor.
    pub fn held_by(mut self, worker_id: impl Into<String>) -> Self {
        let worker_id = worker_id.into();
        self.actor = Some(worker_id.clone());
        self.expected_worker = Some(worker_id);
        self
    }

    /// Records the acting operator or component.
    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the history reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the failure fingerprint.
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Sets the error message.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the block reason.
    pub fn blocked_on(mut self, reason: BlockReason) -> Self {
        self.block_reason = Some(reason);
        self
    }

    /// Sets completion evidence.
    pub fn evidence(mut self, evidence: serde_json::Value) -> Self {
        self.completion_evidence = Some(evidence);
        self
    }

    /// Sets the actual cost.
    pub fn actual_cost(mut self, cost: Option<f64>) -> Self {
        self.actual_cost = cost;
        self
    }

    /// Counts one failed attempt.
    pub fn count_attempt(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    /// Zeroes the attempt counter.
    pub fn reset_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }

    /// Delays the next claim until `at`.
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    /// Keeps `worker_id` from claiming the task until `until`.
    pub fn avoid(mut self, worker_id: impl Into<String>, until: DateTime<Utc>) -> Self {
        self.avoid = Some((worker_id.into(), until));
        self
    }
}

/// The task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending task. Unknown dependencies are a validation error;
    /// a dedupe-key collision is reported as [`InsertOutcome::Duplicate`].
    async fn insert_task(&self, task: &Task) -> OverseerResult<InsertOutcome>;

    /// Task by id.
    async fn get_task(&self, id: Uuid) -> OverseerResult<Option<Task>>;

    /// Tasks matching `filter`, highest priority first.
    async fn list_tasks(&self, filter: &TaskFilter) -> OverseerResult<Vec<Task>>;

    /// Ordered claim candidates for a worker: claimable status, available,
    /// dependencies completed, type within `capabilities`, not avoiding this
    /// worker. Ordered by priority rank, then creation time.
    async fn claim_candidates(
        &self,
        worker_id: &str,
        capabilities: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> OverseerResult<Vec<Uuid>>;

    /// Conditional update acquiring `task_id` for `worker_id`. Returns `true`
    /// only when exactly one row was affected.
    async fn try_claim(
        &self,
        task_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool>;

    /// Apply a guarded status change. Fails with `InvalidTransition` when the
    /// move is not in the lifecycle table and with `Conflict` when the task is
    /// no longer in `from`.
    async fn transition(&self, transition: &Transition) -> OverseerResult<Task>;

    /// Whether every dependency of `task_id` exists and is completed.
    async fn dependencies_met(&self, task_id: Uuid) -> OverseerResult<bool>;

    /// History of a task, oldest first.
    async fn history(&self, task_id: Uuid) -> OverseerResult<Vec<HistoryEntry>>;

    /// Task counts per status.
    async fn status_counts(&self) -> OverseerResult<Vec<(TaskStatus, u64)>>;
}

/// Worker registration and heartbeats.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Idempotent upsert; marks the worker active and replaces its capabilities.
    async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord>;

    /// Idempotent upsert of liveness; unknown workers are created without
    /// capabilities.
    async fn heartbeat(
        &self,
        worker_id: &str,
        current_task: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord>;

    /// Worker by id.
    async fn get_worker(&self, worker_id: &str) -> OverseerResult<Option<WorkerRecord>>;

    /// All workers.
    async fn list_workers(&self) -> OverseerResult<Vec<WorkerRecord>>;

    /// Non-offline workers whose last heartbeat is older than `cutoff`.
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> OverseerResult<Vec<WorkerRecord>>;

    /// Mark a worker offline only if it is still stale at `cutoff`.
    async fn mark_offline(&self, worker_id: &str, cutoff: DateTime<Utc>) -> OverseerResult<bool>;

    /// Unconditional status change, used on graceful shutdown.
    async fn set_worker_offline(&self, worker_id: &str) -> OverseerResult<()>;
}

/// Where a counted failure left the task.
#[derive(Debug, Clone)]
pub enum FailureRecord {
    /// Attempts remained and the retry step was applied.
    Retried(Task),
    /// Attempts exhausted; the task was parked.
    DeadLettered {
        /// The task as parked.
        task: Task,
        /// Its dead-letter entry.
        entry: DeadLetterEntry,
    },
}

/// Builds the retry transition for a task that still has attempts left, from
/// its state right after the failure was counted.
pub type RetryStep<'a> = dyn Fn(&Task) -> Transition + Send + Sync + 'a;

/// Parked tasks that exhausted their retry budget.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Apply `failure` (a move to `failed` that counts the attempt) and, in
    /// the same transaction, either apply the transition built by `retry` or
    /// dead-letter the task. The task is never observable as `failed`.
    async fn record_failure(
        &self,
        failure: &Transition,
        retry: &RetryStep<'_>,
        max_retries: u32,
    ) -> OverseerResult<FailureRecord>;

    /// Move a failed task to `dead_lettered` and record it, atomically.
    /// An existing entry for the task has its `failure_count` incremented.
    async fn dead_letter(
        &self,
        task_id: Uuid,
        reason: &str,
        fingerprint: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry>;

    /// Dead-letter entry for a task.
    async fn get_dead_letter(&self, task_id: Uuid) -> OverseerResult<Option<DeadLetterEntry>>;

    /// Dead-letter entries, optionally by status.
    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> OverseerResult<Vec<DeadLetterEntry>>;

    /// Resolve or abandon an open entry.
    async fn close_dead_letter(
        &self,
        task_id: Uuid,
        status: DeadLetterStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry>;

    /// Return a dead-lettered task to the queue with a fresh attempt budget.
    async fn requeue_dead_letter(&self, task_id: Uuid, now: DateTime<Utc>)
        -> OverseerResult<Task>;
}

/// Approval requests.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Park an in-progress task held by `worker_id` in `waiting_approval` and
    /// insert `request`, atomically.
    async fn open_approval(
        &self,
        request: &ApprovalRequest,
        worker_id: &str,
    ) -> OverseerResult<ApprovalRequest>;

    /// Approval request by id.
    async fn get_approval(&self, id: Uuid) -> OverseerResult<Option<ApprovalRequest>>;

    /// Most recent request for a task.
    async fn latest_approval(&self, task_id: Uuid) -> OverseerResult<Option<ApprovalRequest>>;

    /// Approval requests, optionally by decision.
    async fn list_approvals(
        &self,
        decision: Option<ApprovalDecision>,
    ) -> OverseerResult<Vec<ApprovalRequest>>;

    /// Pending requests whose deadline has passed.
    async fn expired_approvals(&self, now: DateTime<Utc>) -> OverseerResult<Vec<ApprovalRequest>>;

    /// Decide a pending request exactly once and move its task accordingly:
    /// approved tasks return to `pending`, rejected ones become `rejected`.
    /// For `Expired`, `applied_default` says which of the two happens.
    async fn decide_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        applied_default: Option<ApprovalDecision>,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)>;
}

/// Raised-severity records.
#[async_trait]
pub trait EscalationStore: Send + Sync {
    /// Insert `escalation` unless one with the same dedupe key was raised
    /// within `cooldown`. Returns the stored record when inserted.
    async fn raise_escalation(
        &self,
        escalation: &Escalation,
        cooldown: Duration,
    ) -> OverseerResult<Option<Escalation>>;

    /// Escalations, optionally by status, newest first.
    async fn list_escalations(
        &self,
        status: Option<EscalationStatus>,
    ) -> OverseerResult<Vec<Escalation>>;

    /// Marks an escalation acknowledged; conflicts if it already is.
    async fn acknowledge_escalation(&self, id: Uuid, now: DateTime<Utc>)
        -> OverseerResult<Escalation>;
}

/// Outcome of recording a generated task's result on its definition.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    /// Definition after the outcome was applied.
    pub definition: ScheduledTaskDefinition,
    /// This outcome pushed the definition over its failure limit.
    pub disabled_now: bool,
}

/// Recurring task definitions.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a definition; returns `false` if the name is taken.
    async fn insert_schedule(&self, definition: &ScheduledTaskDefinition) -> OverseerResult<bool>;

    /// Definition by name.
    async fn get_schedule(&self, name: &str) -> OverseerResult<Option<ScheduledTaskDefinition>>;

    /// All definitions.
    async fn list_schedules(&self) -> OverseerResult<Vec<ScheduledTaskDefinition>>;

    /// Enabled definitions due at `now`.
    async fn due_schedules(&self, now: DateTime<Utc>)
        -> OverseerResult<Vec<ScheduledTaskDefinition>>;

    /// Move `next_run_at` from `expected` to `next`; `false` if another
    /// scheduler already advanced it.
    async fn advance_schedule(
        &self,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        generated: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool>;

    /// Enables or disables a definition.
    async fn set_schedule_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> OverseerResult<ScheduledTaskDefinition>;

    /// Record a generated task's terminal outcome.
    async fn record_schedule_outcome(
        &self,
        name: &str,
        success: bool,
        status: &str,
    ) -> OverseerResult<ScheduleOutcome>;
}

/// Cost limits and allocations.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Limits for `scope`; unlimited when none are stored.
    async fn get_limits(&self, scope: &BudgetScope) -> OverseerResult<BudgetLimits>;

    /// Every stored scope with its limits.
    async fn list_limits(&self) -> OverseerResult<Vec<(BudgetScope, BudgetLimits)>>;

    /// Sets or clears one limit.
    async fn set_limit(
        &self,
        scope: &BudgetScope,
        period: BudgetPeriod,
        limit: Option<f64>,
    ) -> OverseerResult<BudgetLimits>;

    /// Store `limits` for `scope` only if nothing is recorded yet.
    async fn seed_limits(&self, scope: &BudgetScope, limits: &BudgetLimits)
        -> OverseerResult<bool>;

    /// Spending per current period for a scope.
    async fn usage(&self, scope: &BudgetScope, now: DateTime<Utc>) -> OverseerResult<BudgetUsage>;

    /// Records a new reservation.
    async fn allocate(&self, allocation: &ResourceAllocation) -> OverseerResult<()>;

    /// Close the open allocation of a task as completed.
    async fn finalize_allocation(
        &self,
        task_id: Uuid,
        actual_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool>;

    /// Close the open allocation of a task as released.
    async fn release_allocation(&self, task_id: Uuid, now: DateTime<Utc>) -> OverseerResult<bool>;

    /// Reservations for a task.
    async fn allocations_for_task(&self, task_id: Uuid)
        -> OverseerResult<Vec<ResourceAllocation>>;
}
