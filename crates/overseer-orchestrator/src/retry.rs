//! Retry / dead-letter decisions for failed tasks.

use crate::config::{span_millis, span_secs, RetryConfig};
use crate::escalation::Escalator;
use crate::scheduler::Scheduler;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{
    fingerprint, DeadLetterEntry, Escalation, HistoryEvent, OverseerError, OverseerResult,
    Severity, Task, TaskStatus,
};
use overseer_store::{DeadLetterStore, FailureRecord, TaskFilter, TaskStore, Transition};
use std::sync::Arc;

/// Backoff and reassignment settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub backoff_base_ms: u64,
    /// Upper bound on any retry delay.
    pub backoff_max_ms: u64,
    /// Keep the failing worker off the retry for `reassign_window`.
    pub reassign: bool,
    /// How long the failing worker is kept off the task.
    pub reassign_window: Duration,
    /// Operator requeues allowed per dead-letter entry.
    pub dead_letter_max_retries: u32,
}

impl RetryPolicy {
    /// Policy from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
            reassign: config.reassign_to_different_worker,
            reassign_window: span_secs(config.reassign_window_secs),
            dead_letter_max_retries: config.dead_letter_max_retries,
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// and capped at the maximum.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        delay.min(self.backoff_max_ms)
    }

    /// [`Self::backoff_ms`] as a duration.
    pub fn backoff(&self, attempt: u32) -> Duration {
        span_millis(self.backoff_ms(attempt))
    }

    /// The `failed -> pending` step for a task whose failure was just
    /// counted.
    fn retry_step(&self, failed: &Task, fp: &str, now: DateTime<Utc>) -> Transition {
        let retry_at = now + self.backoff(failed.attempt_count);
        let mut step = Transition::new(
            failed.id,
            TaskStatus::Failed,
            TaskStatus::Pending,
            HistoryEvent::RetryScheduled,
        )
        .available_at(retry_at)
        .fingerprint(fp)
        .reason(format!(
            "retry {} of {}",
            failed.attempt_count,
            failed.max_attempts.saturating_sub(1)
        ))
        .at(now);
        if self.reassign {
            if let Some(worker) = &failed.last_worker {
                step = step.avoid(worker.clone(), now + self.reassign_window);
            }
        }
        step
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Where a failure left the task.
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Back in the queue, claimable from `retry_at`.
    Retrying {
        /// The requeued task.
        task: Task,
        /// When the retry becomes claimable.
        retry_at: DateTime<Utc>,
    },
    /// Attempts exhausted; parked for an operator.
    DeadLettered {
        /// The parked task.
        task: Task,
        /// Its dead-letter entry.
        entry: DeadLetterEntry,
    },
}

impl FailureOutcome {
    /// The task after the failure was handled.
    pub fn task(&self) -> &Task {
        match self {
            FailureOutcome::Retrying { task, .. } | FailureOutcome::DeadLettered { task, .. } => {
                task
            }
        }
    }
}

/// Applies the retry policy to failed tasks.
pub struct RetryManager {
    tasks: Arc<dyn TaskStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    escalator: Escalator,
    scheduler: Arc<Scheduler>,
    policy: RetryPolicy,
}

impl RetryManager {
    /// Manager over the task and dead-letter stores.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        escalator: Escalator,
        scheduler: Arc<Scheduler>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            dead_letters,
            escalator,
            scheduler,
            policy,
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure of `task` (in progress or awaiting external
    /// completion) and decide what happens next.
    ///
    /// The attempt is counted with the move to `failed`. With attempts left
    /// the task goes back to `pending` after a backoff, kept away from the
    /// worker that failed it; otherwise it is dead-lettered. Both steps
    /// commit together, so no claimer ever sees the task in `failed`.
    pub async fn handle_failure(
        &self,
        task: &Task,
        error: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<FailureOutcome> {
        let fp = fingerprint(error);
        let mut to_failed =
            Transition::new(task.id, task.status, TaskStatus::Failed, HistoryEvent::Failed)
                .count_attempt()
                .fingerprint(fp.clone())
                .error(error)
                .reason(error)
                .at(now);
        if let Some(worker) = &task.assigned_worker {
            to_failed = to_failed.held_by(worker.clone());
        }

        let retry = |failed: &Task| self.policy.retry_step(failed, &fp, now);
        let record = self
            .dead_letters
            .record_failure(&to_failed, &retry, self.policy.dead_letter_max_retries)
            .await?;

        match record {
            FailureRecord::Retried(task) => {
                tracing::warn!(
                    task_id = %task.id,
                    attempt = task.attempt_count,
                    max_attempts = task.max_attempts,
                    fingerprint = %fp,
                    error = %error,
                    retry_at = %task.available_at,
                    "Task failed, retry scheduled"
                );
                Ok(FailureOutcome::Retrying {
                    retry_at: task.available_at,
                    task,
                })
            }
            FailureRecord::DeadLettered { task, entry } => {
                self.announce_dead_letter(&task, &entry, error, now).await;
                Ok(FailureOutcome::DeadLettered { task, entry })
            }
        }
    }

    /// Dead-letter a task already sitting in `failed` with no attempts left.
    async fn park(
        &self,
        failed: &Task,
        error: &str,
        fp: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<FailureOutcome> {
        let entry = self
            .dead_letters
            .dead_letter(failed.id, error, fp, self.policy.dead_letter_max_retries, now)
            .await?;
        let task = self
            .tasks
            .get_task(failed.id)
            .await?
            .ok_or_else(|| OverseerError::NotFound(format!("task {}", failed.id)))?;
        self.announce_dead_letter(&task, &entry, error, now).await;
        Ok(FailureOutcome::DeadLettered { task, entry })
    }

    async fn announce_dead_letter(
        &self,
        task: &Task,
        entry: &DeadLetterEntry,
        error: &str,
        now: DateTime<Utc>,
    ) {
        tracing::warn!(
            task_id = %task.id,
            failure_count = entry.failure_count,
            "Task dead-lettered"
        );
        self.escalator
            .raise_logged(
                Escalation::new(
                    format!("dead_letter:{}", task.id),
                    Severity::Warning,
                    format!(
                        "task '{}' dead-lettered after {} attempts: {error}",
                        task.title, task.attempt_count
                    ),
                )
                .for_task(task.id)
                .from_source("retry")
                .at(now),
            )
            .await;
        if let Err(e) = self.scheduler.record_outcome(task).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to record schedule outcome");
        }
    }

    /// Dead-letter failed tasks that have no attempts left but were never
    /// parked, such as rows written before failures were recorded in one
    /// transaction. Returns how many were parked.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> OverseerResult<usize> {
        let failed = self
            .tasks
            .list_tasks(&TaskFilter::default().with_status(TaskStatus::Failed))
            .await?;
        let mut parked = 0;
        for task in failed.into_iter().filter(|t| !t.has_attempts_left()) {
            let error = task
                .error_message
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string());
            match self.park(&task, &error, &fingerprint(&error), now).await {
                Ok(_) => parked += 1,
                Err(OverseerError::Conflict(_) | OverseerError::InvalidTransition { .. }) => {
                    tracing::debug!(task_id = %task.id, "Failed task moved on before housekeeping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(parked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use overseer_store::{EscalationStore, SqliteStore};

    fn manager(store: &Arc<SqliteStore>) -> RetryManager {
        let escalator = Escalator::new(store.clone(), Duration::minutes(15));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            store.clone(),
            escalator.clone(),
            3,
            5,
        ));
        RetryManager::new(
            store.clone(),
            store.clone(),
            escalator,
            scheduler,
            RetryPolicy::default(),
        )
    }

    async fn claimed(store: &SqliteStore, max_attempts: u32, now: DateTime<Utc>) -> Task {
        let task = Task::new("email", "flaky").with_max_attempts(max_attempts);
        store.insert_task(&task).await.unwrap();
        assert!(store.try_claim(task.id, "w1", now).await.unwrap());
        store.get_task(task.id).await.unwrap().unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base_ms: 1_000,
            backoff_max_ms: 5_000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_ms(1), 1_000);
        assert_eq!(policy.backoff_ms(2), 2_000);
        assert_eq!(policy.backoff_ms(3), 4_000);
        assert_eq!(policy.backoff_ms(4), 5_000);
        assert_eq!(policy.backoff_ms(200), 5_000);
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_retries_elsewhere() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let task = claimed(&store, 3, now).await;

        let outcome = manager(&store).handle_failure(&task, "connection reset", now).await.unwrap();
        let FailureOutcome::Retrying { task, retry_at } = outcome else {
            panic!("expected a retry");
        };
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("connection reset"));
        assert_eq!(task.avoid_worker.as_deref(), Some("w1"));
        assert!(retry_at > now);

        let later = retry_at + Duration::seconds(1);
        let caps = vec!["email".to_string()];
        assert!(store.claim_candidates("w1", &caps, 4, later).await.unwrap().is_empty());
        assert_eq!(store.claim_candidates("w2", &caps, 4, later).await.unwrap(), vec![task.id]);
    }

    #[tokio::test]
    async fn test_last_attempt_dead_letters_and_escalates() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let task = claimed(&store, 1, now).await;

        let outcome = manager(&store).handle_failure(&task, "boom", now).await.unwrap();
        let FailureOutcome::DeadLettered { task, entry } = outcome else {
            panic!("expected dead-letter");
        };
        assert_eq!(task.status, TaskStatus::DeadLettered);
        assert_eq!(entry.failure_count, 1);
        assert_eq!(entry.fingerprint, fingerprint("boom"));

        let escalations = store.list_escalations(None).await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].dedupe_key, format!("dead_letter:{}", task.id));
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let task = claimed(&store, 3, now).await;
        let retry = manager(&store);
        retry.handle_failure(&task, "first", now).await.unwrap();
        let err = retry.handle_failure(&task, "second", now).await.unwrap_err();
        assert!(matches!(err, OverseerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_housekeeping_parks_exhausted_failures() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let task = claimed(&store, 1, now).await;
        store
            .transition(
                &Transition::new(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    HistoryEvent::Failed,
                )
                .held_by("w1")
                .count_attempt()
                .error("disk full"),
            )
            .await
            .unwrap();

        assert_eq!(manager(&store).housekeeping(now).await.unwrap(), 1);
        let entry = store.get_dead_letter(task.id).await.unwrap().unwrap();
        assert_eq!(entry.failure_reason, "disk full");
        assert_eq!(manager(&store).housekeeping(now).await.unwrap(), 0);
    }
}
