//! Administrative surface over a running orchestrator.
//!
//! Every operation reports missing records as `NotFound`, lost races and
//! wrong states as `Conflict`, and bad input as `Validation`, so callers can
//! map outcomes to response codes without inspecting messages.

use crate::config::ScheduleConfig;
use crate::engine::Orchestrator;
use crate::retry::FailureOutcome;
use crate::sweeper::{sweep_all, SweepReport};
use chrono::{DateTime, Utc};
use overseer_core::{
    ApprovalDecision, ApprovalRequest, BudgetLimits, BudgetPeriod, BudgetScope, BudgetUsage,
    DeadLetterEntry, DeadLetterStatus, Escalation, EscalationStatus, HistoryEntry, OverseerError,
    OverseerResult, Priority, ResourceAllocation, ScheduledTaskDefinition, Task, TaskStatus,
    WorkerRecord,
};
use overseer_store::{InsertOutcome, TaskFilter};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Everything recorded about one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    /// Current record.
    pub task: Task,
    /// Every history entry, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Latest approval request, if any.
    pub approval: Option<ApprovalRequest>,
    /// Dead-letter entry, if the task was ever parked.
    pub dead_letter: Option<DeadLetterEntry>,
    /// Budget allocations made for the task.
    pub allocations: Vec<ResourceAllocation>,
}

/// Limits and current usage of one budget scope.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    /// Scope key, `global` or `worker:<id>`.
    pub scope: String,
    /// Configured limits.
    pub limits: BudgetLimits,
    /// Spend in each period.
    pub usage: BudgetUsage,
}

/// Result of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    /// Id of the submitted task.
    pub task_id: Uuid,
    /// `false` when the dedupe key matched an existing task.
    pub inserted: bool,
}

/// Operator-facing API behind the `overseer` CLI.
pub struct OperatorConsole {
    orchestrator: Arc<Orchestrator>,
}

impl OperatorConsole {
    /// Console over a running orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// The wrapped orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    // --- tasks ---

    /// Submit a new task.
    pub async fn submit(&self, task: Task) -> OverseerResult<Submission> {
        let outcome = self.orchestrator.submit(&task).await?;
        Ok(Submission {
            task_id: task.id,
            inserted: outcome == InsertOutcome::Inserted,
        })
    }

    /// Tasks filtered by status and priority, in claim order.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        priority: Option<Priority>,
        limit: Option<usize>,
    ) -> OverseerResult<Vec<Task>> {
        let filter = TaskFilter {
            status,
            priority,
            limit,
            ..TaskFilter::default()
        };
        self.orchestrator.stores().tasks.list_tasks(&filter).await
    }

    /// A task with its history, approval, dead-letter entry and allocations.
    pub async fn show_task(&self, task_id: Uuid) -> OverseerResult<TaskDetail> {
        let stores = self.orchestrator.stores();
        let task = self.task(task_id).await?;
        Ok(TaskDetail {
            history: stores.tasks.history(task_id).await?,
            approval: stores.approvals.latest_approval(task_id).await?,
            dead_letter: stores.dead_letters.get_dead_letter(task_id).await?,
            allocations: stores.budget.allocations_for_task(task_id).await?,
            task,
        })
    }

    /// Claim a specific task for `worker_id`. A task that exists but is not
    /// claimable, or was taken first by someone else, is a `Conflict`.
    pub async fn claim(
        &self,
        task_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let before = self.task(task_id).await?;
        if !self
            .orchestrator
            .claims()
            .claim_task(task_id, worker_id, now)
            .await?
        {
            return Err(OverseerError::Conflict(format!(
                "task {task_id} could not be claimed (status {}, assigned to {})",
                before.status,
                before.assigned_worker.as_deref().unwrap_or("nobody")
            )));
        }
        self.task(task_id).await
    }

    /// Return an in-progress task held by `worker_id` to the queue.
    pub async fn release(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        self.task(task_id).await?;
        self.orchestrator
            .release_task(task_id, worker_id, reason, now)
            .await
    }

    /// Complete a task with `evidence`, optionally reporting its real cost.
    pub async fn complete(
        &self,
        task_id: Uuid,
        evidence: serde_json::Value,
        actual_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        if let Some(cost) = actual_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(OverseerError::Validation(format!(
                    "actual cost must be a non-negative number, got {cost}"
                )));
            }
        }
        self.orchestrator
            .complete_task(task_id, evidence, actual_cost, "operator", now)
            .await
    }

    /// Record a failure; the retry policy decides what happens next.
    pub async fn fail(
        &self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<FailureOutcome> {
        if error.trim().is_empty() {
            return Err(OverseerError::Validation(
                "failure reason must not be empty".into(),
            ));
        }
        self.orchestrator.fail_task(task_id, error, now).await
    }

    // --- dead letters ---

    /// Dead-letter entries, optionally by status.
    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> OverseerResult<Vec<DeadLetterEntry>> {
        self.orchestrator
            .stores()
            .dead_letters
            .list_dead_letters(status)
            .await
    }

    /// Closes an entry as handled.
    pub async fn resolve_dead_letter(
        &self,
        task_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry> {
        self.orchestrator
            .stores()
            .dead_letters
            .close_dead_letter(task_id, DeadLetterStatus::Resolved, note, now)
            .await
    }

    /// Closes an entry and drops the work.
    pub async fn abandon_dead_letter(
        &self,
        task_id: Uuid,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry> {
        self.orchestrator
            .stores()
            .dead_letters
            .close_dead_letter(task_id, DeadLetterStatus::Abandoned, note, now)
            .await
    }

    /// Put a dead-lettered task back in the queue with a fresh attempt budget.
    pub async fn requeue_dead_letter(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        self.orchestrator
            .stores()
            .dead_letters
            .requeue_dead_letter(task_id, now)
            .await
    }

    // --- approvals ---

    /// Approval requests, optionally by decision.
    pub async fn list_approvals(
        &self,
        decision: Option<ApprovalDecision>,
    ) -> OverseerResult<Vec<ApprovalRequest>> {
        self.orchestrator
            .stores()
            .approvals
            .list_approvals(decision)
            .await
    }

    /// Approves a pending request and requeues its task.
    pub async fn approve(
        &self,
        id: Uuid,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        self.orchestrator
            .approvals()
            .approve(id, reviewer, reason, now)
            .await
    }

    /// Rejects a pending request and its task.
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        self.orchestrator
            .approvals()
            .reject(id, reviewer, reason, now)
            .await
    }

    // --- schedules ---

    /// All schedule definitions.
    pub async fn list_schedules(&self) -> OverseerResult<Vec<ScheduledTaskDefinition>> {
        self.orchestrator.stores().schedules.list_schedules().await
    }

    /// Add a recurring definition; a taken name is a `Conflict`.
    pub async fn add_schedule(
        &self,
        config: &ScheduleConfig,
        now: DateTime<Utc>,
    ) -> OverseerResult<ScheduledTaskDefinition> {
        let scheduler = self.orchestrator.scheduler();
        let definition = scheduler
            .definition_from_config(config, now)
            .map_err(|e| OverseerError::Validation(e.to_string()))?;
        if !scheduler.add_definition(&definition).await? {
            return Err(OverseerError::Conflict(format!(
                "schedule '{}' already exists",
                definition.name
            )));
        }
        Ok(definition)
    }

    /// Enables or disables a schedule by name.
    pub async fn set_schedule_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> OverseerResult<ScheduledTaskDefinition> {
        self.orchestrator
            .stores()
            .schedules
            .set_schedule_enabled(name, enabled)
            .await
    }

    // --- budget ---

    /// Limits and usage for `scope`, or for every scope with limits
    /// (always including global) when `scope` is `None`.
    pub async fn budget_status(
        &self,
        scope: Option<BudgetScope>,
        now: DateTime<Utc>,
    ) -> OverseerResult<Vec<BudgetStatus>> {
        let ledger = &self.orchestrator.stores().budget;
        let scopes = match scope {
            Some(scope) => vec![scope],
            None => {
                let mut scopes = vec![BudgetScope::Global];
                for (scope, _) in ledger.list_limits().await? {
                    if !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
                scopes
            }
        };
        let mut statuses = Vec::with_capacity(scopes.len());
        for scope in scopes {
            statuses.push(BudgetStatus {
                limits: ledger.get_limits(&scope).await?,
                usage: ledger.usage(&scope, now).await?,
                scope: scope.key(),
            });
        }
        Ok(statuses)
    }

    /// Set or clear (`None`) one period limit.
    pub async fn set_budget_limit(
        &self,
        scope: &BudgetScope,
        period: BudgetPeriod,
        limit: Option<f64>,
    ) -> OverseerResult<BudgetLimits> {
        if let Some(value) = limit {
            if !value.is_finite() || value < 0.0 {
                return Err(OverseerError::Validation(format!(
                    "budget limit must be a non-negative number, got {value}"
                )));
            }
        }
        let limits = self
            .orchestrator
            .stores()
            .budget
            .set_limit(scope, period, limit)
            .await?;
        tracing::info!(scope = %scope, period = %period, limit = ?limit, "Budget limit set");
        Ok(limits)
    }

    // --- workers ---

    /// All known workers.
    pub async fn list_workers(&self) -> OverseerResult<Vec<WorkerRecord>> {
        self.orchestrator.stores().workers.list_workers().await
    }

    /// Registers a worker with its capabilities.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        self.orchestrator
            .health()
            .register(worker_id, capabilities, now)
            .await
    }

    /// Records a heartbeat for a worker.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        current_task: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        self.orchestrator
            .health()
            .heartbeat(worker_id, current_task, now)
            .await
    }

    // --- escalations ---

    /// Escalations, newest first.
    pub async fn list_escalations(
        &self,
        status: Option<EscalationStatus>,
    ) -> OverseerResult<Vec<Escalation>> {
        self.orchestrator
            .stores()
            .escalations
            .list_escalations(status)
            .await
    }

    /// Marks an escalation as seen.
    pub async fn acknowledge_escalation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> OverseerResult<Escalation> {
        self.orchestrator
            .stores()
            .escalations
            .acknowledge_escalation(id, now)
            .await
    }

    /// Run every sweep once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        sweep_all(&self.orchestrator, now).await
    }

    async fn task(&self, task_id: Uuid) -> OverseerResult<Task> {
        self.orchestrator
            .stores()
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| OverseerError::NotFound(format!("task {task_id}")))
    }
}
