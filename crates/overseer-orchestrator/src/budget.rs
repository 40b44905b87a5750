//! Fail-closed cost limits.
//!
//! `check_budget` never returns an error: a ledger that cannot be read
//! denies the task, exactly as an exceeded limit would.

use crate::gate::{fail_closed, Gate, GateDecision};
use chrono::{DateTime, Utc};
use overseer_core::{
    AllocationStatus, BudgetPeriod, BudgetScope, OverseerResult, ResourceAllocation, Task,
};
use overseer_store::BudgetLedger;
use std::sync::Arc;
use uuid::Uuid;

/// Answer of the budget check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    /// Every applicable limit has room.
    Allowed,
    /// A limit would be exceeded; carries the reason.
    Denied(String),
}

impl BudgetDecision {
    /// True for [`BudgetDecision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed)
    }
}

/// Checks period limits and keeps the allocation ledger.
pub struct BudgetEnforcer {
    ledger: Arc<dyn BudgetLedger>,
}

impl BudgetEnforcer {
    /// Enforcer over `ledger`.
    pub fn new(ledger: Arc<dyn BudgetLedger>) -> Self {
        Self { ledger }
    }

    /// Evaluate `task` against the worker's limits (when a worker is given)
    /// and then the global limits. Recorded usage plus the task's estimate
    /// must stay within every configured period limit.
    pub async fn check_budget(
        &self,
        task: &Task,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> BudgetDecision {
        let result = self.evaluate(task, worker_id, now).await;
        match fail_closed(Gate::Budget, task.id, result) {
            GateDecision::Allow => BudgetDecision::Allowed,
            GateDecision::Deny { reason, .. } => {
                tracing::warn!(task_id = %task.id, reason = %reason, "Budget denied");
                BudgetDecision::Denied(reason)
            }
        }
    }

    async fn evaluate(
        &self,
        task: &Task,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<GateDecision> {
        let mut scopes = Vec::with_capacity(2);
        if let Some(worker) = worker_id {
            scopes.push(BudgetScope::Worker(worker.to_string()));
        }
        scopes.push(BudgetScope::Global);

        for scope in scopes {
            let limits = self.ledger.get_limits(&scope).await?;
            if limits.is_unlimited() {
                continue;
            }
            let usage = self.ledger.usage(&scope, now).await?;
            for period in BudgetPeriod::ALL {
                let Some(limit) = limits.get(period) else {
                    continue;
                };
                let spent = usage.get(period);
                if spent + task.estimated_cost > limit {
                    return Ok(GateDecision::deny(format!(
                        "{scope} {period} budget exceeded: \
                         {spent:.2} spent + {:.2} estimated > {limit:.2}",
                        task.estimated_cost
                    )));
                }
            }
        }
        Ok(GateDecision::Allow)
    }

    /// Record the task's estimated cost against `worker_id`.
    pub async fn allocate(
        &self,
        task: &Task,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<ResourceAllocation> {
        let allocation = ResourceAllocation {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: worker_id.to_string(),
            estimated_cost: task.estimated_cost,
            actual_cost: None,
            status: AllocationStatus::Allocated,
            created_at: now,
            finalized_at: None,
        };
        self.ledger.allocate(&allocation).await?;
        tracing::debug!(
            task_id = %task.id,
            worker_id = %worker_id,
            estimated = task.estimated_cost,
            "Cost allocated"
        );
        Ok(allocation)
    }

    /// Close the open allocation as completed, with the actual cost if known.
    pub async fn finalize(
        &self,
        task_id: Uuid,
        actual_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool> {
        self.ledger.finalize_allocation(task_id, actual_cost, now).await
    }

    /// Close the open allocation without spending it.
    pub async fn release(&self, task_id: Uuid, now: DateTime<Utc>) -> OverseerResult<bool> {
        self.ledger.release_allocation(task_id, now).await
    }

    /// `release`, logging instead of returning errors. Used where the
    /// allocation is bookkeeping after the task state already changed.
    pub async fn release_logged(&self, task_id: Uuid, now: DateTime<Utc>) {
        if let Err(e) = self.release(task_id, now).await {
            tracing::error!(task_id = %task_id, error = %e, "Failed to release cost allocation");
        }
    }

    /// Underlying ledger.
    pub fn ledger(&self) -> &Arc<dyn BudgetLedger> {
        &self.ledger
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overseer_core::{BudgetLimits, BudgetUsage, OverseerError};
    use overseer_store::SqliteStore;

    /// Ledger whose every read fails.
    struct UnreachableLedger;

    #[async_trait]
    impl BudgetLedger for UnreachableLedger {
        async fn get_limits(&self, _scope: &BudgetScope) -> OverseerResult<BudgetLimits> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn list_limits(&self) -> OverseerResult<Vec<(BudgetScope, BudgetLimits)>> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn set_limit(
            &self,
            _: &BudgetScope,
            _: BudgetPeriod,
            _: Option<f64>,
        ) -> OverseerResult<BudgetLimits> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn seed_limits(&self, _: &BudgetScope, _: &BudgetLimits) -> OverseerResult<bool> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn usage(&self, _: &BudgetScope, _: DateTime<Utc>) -> OverseerResult<BudgetUsage> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn allocate(&self, _: &ResourceAllocation) -> OverseerResult<()> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn finalize_allocation(
            &self,
            _: Uuid,
            _: Option<f64>,
            _: DateTime<Utc>,
        ) -> OverseerResult<bool> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn release_allocation(&self, _: Uuid, _: DateTime<Utc>) -> OverseerResult<bool> {
            Err(OverseerError::Store("connection refused".into()))
        }
        async fn allocations_for_task(&self, _: Uuid) -> OverseerResult<Vec<ResourceAllocation>> {
            Err(OverseerError::Store("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unlimited_allows() {
        let enforcer = BudgetEnforcer::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let task = Task::new("llm", "x").with_estimated_cost(1_000.0);
        assert!(enforcer.check_budget(&task, Some("w1"), Utc::now()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_worker_limit_checked_before_global() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .set_limit(&BudgetScope::Worker("w1".into()), BudgetPeriod::Daily, Some(5.0))
            .await
            .unwrap();
        store.set_limit(&BudgetScope::Global, BudgetPeriod::Monthly, Some(4.0)).await.unwrap();
        let enforcer = BudgetEnforcer::new(store);
        let task = Task::new("llm", "x").with_estimated_cost(6.0);

        let decision = enforcer.check_budget(&task, Some("w1"), Utc::now()).await;
        let BudgetDecision::Denied(reason) = decision else {
            panic!("expected denial");
        };
        assert!(reason.starts_with("worker:w1 daily"), "got: {reason}");

        let decision = enforcer.check_budget(&task, None, Utc::now()).await;
        let BudgetDecision::Denied(reason) = decision else {
            panic!("expected denial");
        };
        assert!(reason.starts_with("global monthly"), "got: {reason}");
    }

    #[tokio::test]
    async fn test_usage_counts_against_limit() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.set_limit(&BudgetScope::Global, BudgetPeriod::Daily, Some(10.0)).await.unwrap();
        let enforcer = BudgetEnforcer::new(store);
        let now = Utc::now();

        let first = Task::new("llm", "a").with_estimated_cost(6.0);
        assert!(enforcer.check_budget(&first, Some("w1"), now).await.is_allowed());
        enforcer.allocate(&first, "w1", now).await.unwrap();

        let second = Task::new("llm", "b").with_estimated_cost(6.0);
        assert!(!enforcer.check_budget(&second, Some("w2"), now).await.is_allowed());

        // a released allocation no longer counts
        assert!(enforcer.release(first.id, now).await.unwrap());
        assert!(enforcer.check_budget(&second, Some("w2"), now).await.is_allowed());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_denies() {
        let enforcer = BudgetEnforcer::new(Arc::new(UnreachableLedger));
        let decision = enforcer.check_budget(&Task::new("llm", "x"), Some("w1"), Utc::now()).await;
        let BudgetDecision::Denied(reason) = decision else {
            panic!("fail-closed violated");
        };
        assert!(reason.contains("could not be evaluated"));
    }
}
