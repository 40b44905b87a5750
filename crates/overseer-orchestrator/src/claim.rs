//! Coordination-free task acquisition.
//!
//! A worker reads a short ordered batch of eligible task ids and attempts
//! the conditional claim on each in turn. Losing a claim is not an error:
//! the worker moves on to the next candidate instead of waiting, and only
//! re-reads the queue once the whole batch has been lost to other workers.

use chrono::{DateTime, Utc};
use overseer_core::{HistoryEvent, OverseerResult, Task, TaskStatus};
use overseer_store::{TaskStore, Transition};
use std::sync::Arc;
use uuid::Uuid;

/// Claim and release against the shared task store.
pub struct ClaimProtocol {
    tasks: Arc<dyn TaskStore>,
    batch: usize,
    rounds: usize,
}

impl ClaimProtocol {
    /// `batch` candidates per selection, at most `rounds` selections per call.
    pub fn new(tasks: Arc<dyn TaskStore>, batch: usize, rounds: usize) -> Self {
        Self {
            tasks,
            batch: batch.max(1),
            rounds: rounds.max(1),
        }
    }

    /// Acquire the best eligible task for `worker_id`, or `None` when the
    /// queue holds nothing this worker may take.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<Option<Task>> {
        for round in 0..self.rounds {
            let candidates = self
                .tasks
                .claim_candidates(worker_id, capabilities, self.batch, now)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }
            for id in candidates {
                if self.tasks.try_claim(id, worker_id, now).await? {
                    tracing::info!(task_id = %id, worker_id = %worker_id, "Task claimed");
                    return self.tasks.get_task(id).await;
                }
                tracing::debug!(task_id = %id, worker_id = %worker_id, round, "Lost claim race");
            }
        }
        tracing::debug!(worker_id = %worker_id, rounds = self.rounds, "Every candidate was taken");
        Ok(None)
    }

    /// Claim one specific task. `Ok(false)` means it was not claimable or
    /// another worker holds it.
    pub async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool> {
        self.tasks.try_claim(task_id, worker_id, now).await
    }

    /// Hand an in-progress task held by `worker_id` back to the queue.
    /// With `avoid_until`, the same worker will not be offered it again
    /// before that instant.
    pub async fn release(
        &self,
        task_id: Uuid,
        worker_id: &str,
        reason: &str,
        avoid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let mut transition =
            Transition::new(
                task_id,
                TaskStatus::InProgress,
                TaskStatus::Pending,
                HistoryEvent::Released,
            )
            .held_by(worker_id)
            .reason(reason)
            .available_at(now)
            .at(now);
        if let Some(until) = avoid_until {
            transition = transition.avoid(worker_id, until);
        }
        let task = self.tasks.transition(&transition).await?;
        tracing::info!(
            task_id = %task_id,
            worker_id = %worker_id,
            reason = %reason,
            "Task released"
        );
        Ok(task)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use overseer_core::{OverseerError, Priority};
    use overseer_store::SqliteStore;

    fn protocol(store: &Arc<SqliteStore>) -> ClaimProtocol {
        ClaimProtocol::new(store.clone(), 4, 2)
    }

    fn caps(types: &[&str]) -> Vec<String> {
        types.iter().map(|t| (*t).to_string()).collect()
    }

    #[tokio::test]
    async fn test_claims_highest_priority_first() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let low = Task::new("email", "low").with_priority(Priority::Low);
        let high = Task::new("email", "high").with_priority(Priority::High);
        store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let claimed = protocol(&store)
            .claim_next("w1", &caps(&["email"]), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.assigned_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_nothing_for_wrong_capability() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.insert_task(&Task::new("email", "x")).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        assert!(protocol(&store)
            .claim_next("w1", &caps(&["report"]), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_second_worker_gets_next_task() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let a = Task::new("email", "a");
        let b = Task::new("email", "b");
        store.insert_task(&a).await.unwrap();
        store.insert_task(&b).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);

        let claims = protocol(&store);
        let first = claims.claim_next("w1", &caps(&["email"]), now).await.unwrap().unwrap();
        let second = claims.claim_next("w2", &caps(&["email"]), now).await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(claims.claim_next("w3", &caps(&["email"]), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_with_avoid_window() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        let claims = protocol(&store);
        claims.claim_next("w1", &caps(&["email"]), now).await.unwrap().unwrap();

        let released = claims
            .release(task.id, "w1", "no handler", Some(now + Duration::minutes(2)), now)
            .await
            .unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert!(released.assigned_worker.is_none());

        assert!(claims.claim_next("w1", &caps(&["email"]), now).await.unwrap().is_none());
        assert!(claims.claim_next("w2", &caps(&["email"]), now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_conflicts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        let claims = protocol(&store);
        assert!(claims.claim_task(task.id, "w1", now).await.unwrap());
        assert!(!claims.claim_task(task.id, "w2", now).await.unwrap());

        let err = claims.release(task.id, "w2", "nope", None, now).await.unwrap_err();
        assert!(matches!(err, OverseerError::Conflict(_)));
    }
}
