use crate::approval::{ApprovalCheck, ApprovalGate, ApprovalPolicy};
use crate::budget::{BudgetDecision, BudgetEnforcer};
use crate::claim::ClaimProtocol;
use crate::config::{span_secs, FallbackHandler, OverseerConfig};
use crate::dispatch::{self, EchoHandler, HandlerRegistry};
use crate::escalation::{EscalationManager, Escalator};
use crate::gate::{fail_closed, inconclusive, Gate, GateDecision};
use crate::health::HealthMonitor;
use crate::retry::{FailureOutcome, RetryManager, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::stores::Stores;
use chrono::{DateTime, Utc};
use overseer_core::{
    ApprovalRequest, BlockReason, BudgetScope, HistoryEvent, OverseerError, OverseerResult, Task,
    TaskStatus,
};
use overseer_store::{InsertOutcome, TaskFilter, Transition};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where processing a claimed task left it.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The handler succeeded and its evidence was accepted.
    Completed(Task),
    /// The handler failed; the retry policy decided the rest.
    Failed(FailureOutcome),
    /// Parked behind a new approval request.
    AwaitingApproval(ApprovalRequest),
    /// Blocked on an unmet dependency or an exhausted budget.
    Blocked {
        /// The blocked task.
        task: Task,
        /// What it waits on.
        reason: BlockReason,
    },
    /// The handler hands completion to an outside party.
    AwaitingExternal(Task),
    /// Handed back to the queue without an attempt being counted.
    Released(Task),
}

impl ProcessOutcome {
    /// Short status label, used by the CLI and in logs.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Completed(_) => "completed",
            ProcessOutcome::Failed(FailureOutcome::Retrying { .. }) => "retrying",
            ProcessOutcome::Failed(FailureOutcome::DeadLettered { .. }) => "dead_lettered",
            ProcessOutcome::AwaitingApproval(_) => "waiting_approval",
            ProcessOutcome::Blocked { .. } => "blocked",
            ProcessOutcome::AwaitingExternal(_) => "awaiting_external_completion",
            ProcessOutcome::Released(_) => "released",
        }
    }
}

/// Every component of one orchestrator process, wired to a shared set of
/// stores.
///
/// Nothing here holds task state in memory: any number of `Orchestrator`
/// instances, in one process or many, may point at the same database and
/// coordinate only through the store's conditional updates.
pub struct Orchestrator {
    stores: Stores,
    config: OverseerConfig,
    handlers: Arc<HandlerRegistry>,
    claims: ClaimProtocol,
    escalator: Escalator,
    scheduler: Arc<Scheduler>,
    retry: RetryManager,
    approvals: Arc<ApprovalGate>,
    budget: Arc<BudgetEnforcer>,
    escalations: EscalationManager,
    health: HealthMonitor,
}

impl Orchestrator {
    /// Build the components from `config`. The configured fallback handler
    /// and evidence policies are applied to `handlers`.
    pub fn new(stores: Stores, config: OverseerConfig, mut handlers: HandlerRegistry) -> Self {
        if config.worker.fallback_handler == FallbackHandler::Echo && !handlers.has_fallback() {
            handlers.set_fallback(Arc::new(EchoHandler));
        }
        for (task_type, policy) in &config.evidence {
            handlers.set_evidence_policy(task_type.clone(), policy.clone());
        }

        let escalator = Escalator::new(
            stores.escalations.clone(),
            span_secs(config.escalation.cooldown_secs),
        );
        let scheduler = Arc::new(Scheduler::new(
            stores.tasks.clone(),
            stores.schedules.clone(),
            escalator.clone(),
            config.retry.default_max_attempts,
            config.scheduler.max_consecutive_failures,
        ));
        let retry = RetryManager::new(
            stores.tasks.clone(),
            stores.dead_letters.clone(),
            escalator.clone(),
            scheduler.clone(),
            RetryPolicy::from_config(&config.retry),
        );
        let approvals = Arc::new(ApprovalGate::new(
            stores.approvals.clone(),
            scheduler.clone(),
            ApprovalPolicy::from_config(&config.approval),
        ));
        let budget = Arc::new(BudgetEnforcer::new(stores.budget.clone()));
        let escalations = EscalationManager::new(
            stores.tasks.clone(),
            stores.approvals.clone(),
            approvals.clone(),
            escalator.clone(),
            span_secs(config.escalation.stuck_threshold_secs),
        );
        let health = HealthMonitor::new(
            stores.workers.clone(),
            stores.tasks.clone(),
            budget.clone(),
            span_secs(config.health.stale_after_secs),
        );
        let claims = ClaimProtocol::new(
            stores.tasks.clone(),
            config.worker.claim_batch,
            config.worker.max_claim_rounds,
        );

        Self {
            stores,
            config,
            handlers: Arc::new(handlers),
            claims,
            escalator,
            scheduler,
            retry,
            approvals,
            budget,
            escalations,
            health,
        }
    }

    /// Store handles.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Effective configuration.
    pub fn config(&self) -> &OverseerConfig {
        &self.config
    }

    /// Registered handlers.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Claim protocol.
    pub fn claims(&self) -> &ClaimProtocol {
        &self.claims
    }

    /// Escalation raiser shared by every component.
    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    /// Recurring task generator.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Retry and dead-letter manager.
    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    /// Approval gate.
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// Budget enforcer.
    pub fn budget(&self) -> &Arc<BudgetEnforcer> {
        &self.budget
    }

    /// Approval-expiry and stuck-task sweep.
    pub fn escalations(&self) -> &EscalationManager {
        &self.escalations
    }

    /// Worker health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Seed configured global limits and `[[schedules]]` into the store.
    /// Existing rows win, so repeated startups are harmless.
    pub async fn bootstrap(&self, now: DateTime<Utc>) -> OverseerResult<()> {
        let limits = self.config.budget.global_limits();
        if !limits.is_unlimited()
            && self
                .stores
                .budget
                .seed_limits(&BudgetScope::Global, &limits)
                .await?
        {
            info!(limits = ?limits, "Seeded global budget limits");
        }
        for schedule in &self.config.schedules {
            let definition = self.scheduler.definition_from_config(schedule, now)?;
            if !self.scheduler.add_definition(&definition).await? {
                tracing::debug!(schedule = %schedule.name, "Schedule already stored");
            }
        }
        Ok(())
    }

    /// Add a producer-supplied task to the queue.
    pub async fn submit(&self, task: &Task) -> OverseerResult<InsertOutcome> {
        let outcome = self.stores.tasks.insert_task(task).await?;
        match outcome {
            InsertOutcome::Inserted => info!(
                task_id = %task.id,
                task_type = %task.task_type,
                priority = %task.priority,
                "Task submitted"
            ),
            InsertOutcome::Duplicate => info!(
                dedupe_key = task.dedupe_key.as_deref().unwrap_or("-"),
                "Duplicate submission ignored"
            ),
        }
        Ok(outcome)
    }

    /// Claim the best eligible task for `worker_id`, if any.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<Option<Task>> {
        self.claims.claim_next(worker_id, capabilities, now).await
    }

    /// Claim one task and run it to its next resting state.
    pub async fn run_once(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<Option<ProcessOutcome>> {
        match self.claim_next(worker_id, capabilities, now).await? {
            Some(task) => self.process(task, worker_id, now).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run a task `worker_id` just claimed through the gates and its handler.
    ///
    /// Gate order: dependencies, approval, budget, then cost allocation. Any
    /// gate that cannot be evaluated denies. A denied dependency or budget
    /// check blocks the task; an approval or allocation that could not be
    /// recorded releases it, since nothing about the task itself is wrong.
    pub async fn process(
        &self,
        task: Task,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<ProcessOutcome> {
        let dependencies = fail_closed(
            Gate::Dependency,
            task.id,
            self.dependency_decision(&task).await,
        );
        if let GateDecision::Deny { reason, .. } = dependencies {
            return self
                .block(&task, worker_id, BlockReason::Dependency, &reason, now)
                .await;
        }

        match self.approvals.check(&task, worker_id, now).await {
            Ok(ApprovalCheck::Proceed) => {}
            Ok(ApprovalCheck::Parked(request)) => {
                return Ok(ProcessOutcome::AwaitingApproval(request));
            }
            Err(e) => {
                let reason = inconclusive(Gate::Approval, task.id, &e);
                return self.release(&task, worker_id, &reason, None, now).await;
            }
        }

        if let BudgetDecision::Denied(reason) = self
            .budget
            .check_budget(&task, Some(worker_id), now)
            .await
        {
            return self
                .block(&task, worker_id, BlockReason::Budget, &reason, now)
                .await;
        }

        if let Err(e) = self.budget.allocate(&task, worker_id, now).await {
            let reason = inconclusive(Gate::Allocation, task.id, &e);
            return self.release(&task, worker_id, &reason, None, now).await;
        }

        let Some(handler) = self.handlers.resolve(&task.task_type) else {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                worker_id = %worker_id,
                "No handler for task type"
            );
            self.budget.release_logged(task.id, now).await;
            let avoid_until = now + self.retry.policy().reassign_window;
            return self
                .release(
                    &task,
                    worker_id,
                    "no handler registered for task type",
                    Some(avoid_until),
                    now,
                )
                .await;
        };

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            worker_id = %worker_id,
            handler = handler.name(),
            "Dispatching task"
        );
        let started = Instant::now();
        let outcome = dispatch::execute(
            handler,
            task.clone(),
            self.config.worker.handler_timeout(),
        )
        .await;
        let elapsed = started.elapsed();
        let finished =
            now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        if outcome.awaiting_external {
            let transition = Transition::new(
                task.id,
                TaskStatus::InProgress,
                TaskStatus::AwaitingExternalCompletion,
                HistoryEvent::AwaitingExternal,
            )
            .at(finished)
            .held_by(worker_id)
            .evidence(outcome.evidence);
            let task = self.stores.tasks.transition(&transition).await?;
            info!(
                task_id = %task.id,
                duration_ms = elapsed.as_millis() as u64,
                "Task awaiting external completion"
            );
            return Ok(ProcessOutcome::AwaitingExternal(task));
        }

        if outcome.success {
            let policy = self.handlers.evidence_policy(&task.task_type);
            match policy.check(&outcome.evidence) {
                Ok(()) => {
                    let transition = Transition::new(
                        task.id,
                        TaskStatus::InProgress,
                        TaskStatus::Completed,
                        HistoryEvent::Completed,
                    )
                    .at(finished)
                    .held_by(worker_id)
                    .evidence(outcome.evidence)
                    .actual_cost(outcome.actual_cost);
                    let completed = self
                        .finish(transition, outcome.actual_cost, finished)
                        .await?;
                    info!(
                        task_id = %completed.id,
                        worker_id = %worker_id,
                        duration_ms = elapsed.as_millis() as u64,
                        "Task completed"
                    );
                    return Ok(ProcessOutcome::Completed(completed));
                }
                Err(rejection) => {
                    warn!(task_id = %task.id, reason = %rejection, "Completion evidence rejected");
                    let error = format!("completion evidence rejected: {rejection}");
                    return self.failed(&task, &error, finished).await;
                }
            }
        }

        let error = outcome.error_message();
        warn!(task_id = %task.id, worker_id = %worker_id, error = %error, "Handler failed");
        self.failed(&task, &error, finished).await
    }

    /// Record completion of an in-progress or externally pending task on
    /// behalf of `actor`.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        evidence: serde_json::Value,
        actual_cost: Option<f64>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let task = self.load_running(task_id).await?;
        self.handlers
            .evidence_policy(&task.task_type)
            .check(&evidence)
            .map_err(|e| {
                OverseerError::Validation(format!("completion evidence rejected: {e}"))
            })?;
        let transition = Transition::new(
            task.id,
            task.status,
            TaskStatus::Completed,
            HistoryEvent::Completed,
        )
        .at(now)
        .by(actor)
        .evidence(evidence)
        .actual_cost(actual_cost);
        let completed = self.finish(transition, actual_cost, now).await?;
        info!(task_id = %task_id, actor = %actor, "Task completed manually");
        Ok(completed)
    }

    /// Record a failure of an in-progress or externally pending task and
    /// apply the retry policy.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<FailureOutcome> {
        let task = self.load_running(task_id).await?;
        self.budget.release_logged(task.id, now).await;
        self.retry.handle_failure(&task, error, now).await
    }

    /// Hand an in-progress task back to the queue.
    pub async fn release_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let task = self
            .claims
            .release(task_id, worker_id, reason, None, now)
            .await?;
        self.budget.release_logged(task_id, now).await;
        Ok(task)
    }

    /// Return blocked tasks to the queue once their blocker has cleared.
    ///
    /// Dependency blocks clear when every dependency completed. Budget
    /// blocks clear when the global limits admit the task again; worker
    /// limits are re-checked by whichever worker claims it next.
    pub async fn sweep_blocked(&self, now: DateTime<Utc>) -> OverseerResult<usize> {
        let blocked = self
            .stores
            .tasks
            .list_tasks(&TaskFilter::default().with_status(TaskStatus::Blocked))
            .await?;
        let mut unblocked = 0;
        for task in blocked {
            let clear = match task.block_reason {
                Some(BlockReason::Dependency) => {
                    let decision = self.dependency_decision(&task).await;
                    fail_closed(Gate::Dependency, task.id, decision).is_allowed()
                }
                Some(BlockReason::Budget) | None => self
                    .budget
                    .check_budget(&task, None, now)
                    .await
                    .is_allowed(),
            };
            if !clear {
                continue;
            }
            let transition = Transition::new(
                task.id,
                TaskStatus::Blocked,
                TaskStatus::Pending,
                HistoryEvent::Unblocked,
            )
            .at(now)
            .reason("blocker cleared")
            .available_at(now);
            match self.stores.tasks.transition(&transition).await {
                Ok(_) => {
                    info!(task_id = %task.id, block_reason = ?task.block_reason, "Task unblocked");
                    unblocked += 1;
                }
                Err(OverseerError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(unblocked)
    }

    async fn dependency_decision(&self, task: &Task) -> OverseerResult<GateDecision> {
        if task.depends_on.is_empty() || self.stores.tasks.dependencies_met(task.id).await? {
            Ok(GateDecision::Allow)
        } else {
            Ok(GateDecision::deny(format!(
                "{} dependencies not all completed",
                task.depends_on.len()
            )))
        }
    }

    async fn block(
        &self,
        task: &Task,
        worker_id: &str,
        reason: BlockReason,
        detail: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<ProcessOutcome> {
        let transition = Transition::new(
            task.id,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            HistoryEvent::Blocked,
        )
        .at(now)
        .held_by(worker_id)
        .blocked_on(reason)
        .reason(detail);
        let task = self.stores.tasks.transition(&transition).await?;
        warn!(
            task_id = %task.id,
            block_reason = reason.as_str(),
            detail = %detail,
            "Task blocked"
        );
        Ok(ProcessOutcome::Blocked { task, reason })
    }

    async fn release(
        &self,
        task: &Task,
        worker_id: &str,
        reason: &str,
        avoid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> OverseerResult<ProcessOutcome> {
        let task = self
            .claims
            .release(task.id, worker_id, reason, avoid_until, now)
            .await?;
        Ok(ProcessOutcome::Released(task))
    }

    async fn failed(
        &self,
        task: &Task,
        error: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<ProcessOutcome> {
        self.budget.release_logged(task.id, now).await;
        self.retry
            .handle_failure(task, error, now)
            .await
            .map(ProcessOutcome::Failed)
    }

    async fn finish(
        &self,
        transition: Transition,
        actual_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let task = self.stores.tasks.transition(&transition).await?;
        if let Err(e) = self.budget.finalize(task.id, actual_cost, now).await {
            error!(task_id = %task.id, error = %e, "Failed to finalize cost allocation");
        }
        if let Err(e) = self.scheduler.record_outcome(&task).await {
            error!(task_id = %task.id, error = %e, "Failed to record schedule outcome");
        }
        Ok(task)
    }

    async fn load(&self, task_id: Uuid) -> OverseerResult<Task> {
        self.stores
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| OverseerError::NotFound(format!("task {task_id}")))
    }

    /// Load a task that is in progress or awaiting external completion.
    async fn load_running(&self, task_id: Uuid) -> OverseerResult<Task> {
        let task = self.load(task_id).await?;
        if !matches!(
            task.status,
            TaskStatus::InProgress | TaskStatus::AwaitingExternalCompletion
        ) {
            return Err(OverseerError::Conflict(format!(
                "task {task_id} is {}, not in progress or awaiting external completion",
                task.status
            )));
        }
        Ok(task)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dispatch::{EvidencePolicy, FnHandler, HandlerOutcome};
    use chrono::Duration;
    use overseer_core::{AllocationStatus, BudgetPeriod, RiskLevel};
    use overseer_store::{BudgetLedger, SqliteStore, TaskStore};
    use serde_json::json;

    fn caps() -> Vec<String> {
        vec!["*".to_string()]
    }

    fn stores(store: &Arc<SqliteStore>) -> Stores {
        Stores {
            tasks: store.clone(),
            workers: store.clone(),
            dead_letters: store.clone(),
            approvals: store.clone(),
            escalations: store.clone(),
            schedules: store.clone(),
            budget: store.clone(),
        }
    }

    fn orchestrator(store: &Arc<SqliteStore>, handlers: HandlerRegistry) -> Orchestrator {
        Orchestrator::new(stores(store), OverseerConfig::default(), handlers)
    }

    fn registry() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "ok",
            Arc::new(FnHandler::new("ok", |t: &Task| {
                Ok(HandlerOutcome::success(json!({"title": t.title})).with_cost(1.5))
            })),
        );
        handlers.register(
            "boom",
            Arc::new(FnHandler::new("boom", |_: &Task| Ok(HandlerOutcome::failure("exploded")))),
        );
        handlers
    }

    #[tokio::test]
    async fn test_successful_run_completes_and_finalizes_cost() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&store, registry());
        let task = Task::new("ok", "hello").with_estimated_cost(2.0);
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::Completed(done) = outcome else {
            panic!("expected completion, got {}", outcome.label());
        };
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.completion_evidence, Some(json!({"title": "hello"})));
        assert_eq!(done.actual_cost, Some(1.5));

        let allocations = store.allocations_for_task(task.id).await.unwrap();
        assert_eq!(allocations[0].status, AllocationStatus::Completed);
        assert_eq!(allocations[0].actual_cost, Some(1.5));
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_away_from_worker() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&store, registry());
        let task = Task::new("boom", "x");
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::Failed(FailureOutcome::Retrying { task: retried, .. }) = outcome else {
            panic!("expected retry, got {}", outcome.label());
        };
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.avoid_worker.as_deref(), Some("w1"));

        let allocations = store.allocations_for_task(task.id).await.unwrap();
        assert_eq!(allocations[0].status, AllocationStatus::Released);
    }

    #[tokio::test]
    async fn test_unknown_type_released_without_attempt() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&store, registry());
        let task = Task::new("mystery", "x");
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::Released(released) = outcome else {
            panic!("expected release, got {}", outcome.label());
        };
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.attempt_count, 0);
        assert!(orch.run_once("w1", &caps(), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_echo_fallback_from_config() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = OverseerConfig::default();
        config.worker.fallback_handler = FallbackHandler::Echo;
        let orch = Orchestrator::new(stores(&store), config, HandlerRegistry::new());
        orch.submit(&Task::new("mystery", "x")).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        assert_eq!(outcome.label(), "completed");
    }

    #[tokio::test]
    async fn test_evidence_policy_turns_success_into_failure() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut handlers = registry();
        handlers.set_evidence_policy("ok", EvidencePolicy::RequireFields(vec!["url".into()]));
        let orch = orchestrator(&store, handlers);
        orch.submit(&Task::new("ok", "x")).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {}", outcome.label());
        };
        assert!(failure
            .task()
            .error_message
            .as_deref()
            .unwrap()
            .contains("completion evidence rejected"));
    }

    #[tokio::test]
    async fn test_budget_block_then_unblock_after_limit_raised() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_limit(&BudgetScope::Global, BudgetPeriod::Daily, Some(1.0)).await.unwrap();
        let orch = orchestrator(&store, registry());
        let task = Task::new("ok", "pricey").with_estimated_cost(5.0);
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::Blocked { task: blocked, reason } = outcome else {
            panic!("expected block, got {}", outcome.label());
        };
        assert_eq!(reason, BlockReason::Budget);
        assert_eq!(blocked.block_reason, Some(BlockReason::Budget));
        assert!(store.allocations_for_task(task.id).await.unwrap().is_empty());

        assert_eq!(orch.sweep_blocked(now).await.unwrap(), 0);
        store.set_limit(&BudgetScope::Global, BudgetPeriod::Daily, Some(10.0)).await.unwrap();
        assert_eq!(orch.sweep_blocked(now).await.unwrap(), 1);
        assert_eq!(store.get_task(task.id).await.unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_approval_parks_before_dispatch() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&store, registry());
        let task = Task::new("ok", "risky").with_approval(RiskLevel::High);
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        let ProcessOutcome::AwaitingApproval(request) = outcome else {
            panic!("expected approval, got {}", outcome.label());
        };
        assert!(store.allocations_for_task(task.id).await.unwrap().is_empty());

        orch.approvals().approve(request.id, Some("ops"), None, now).await.unwrap();
        let later = now + Duration::seconds(1);
        let outcome = orch.run_once("w2", &caps(), later).await.unwrap().unwrap();
        assert_eq!(outcome.label(), "completed");
    }

    #[tokio::test]
    async fn test_awaiting_external_then_manual_completion() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "webhook",
            Arc::new(FnHandler::new("webhook", |_: &Task| {
                Ok(HandlerOutcome::awaiting_external(json!({"ticket": "T-1"})))
            })),
        );
        let orch = orchestrator(&store, handlers);
        let task = Task::new("webhook", "x");
        orch.submit(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let outcome = orch.run_once("w1", &caps(), now).await.unwrap().unwrap();
        assert_eq!(outcome.label(), "awaiting_external_completion");

        let done = orch
            .complete_task(task.id, json!({"ticket": "T-1", "closed": true}), Some(0.5), "ops", now)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(matches!(
            orch.complete_task(task.id, json!({}), None, "ops", now).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_manual_fail_of_pending_task_conflicts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = orchestrator(&store, registry());
        let task = Task::new("ok", "x");
        orch.submit(&task).await.unwrap();
        assert!(matches!(
            orch.fail_task(task.id, "nope", Utc::now()).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));
        assert!(matches!(
            orch.fail_task(Uuid::new_v4(), "nope", Utc::now()).await.unwrap_err(),
            OverseerError::NotFound(_)
        ));
    }
}
