//! Escalations: raising stuck conditions to operators.

use crate::approval::ApprovalGate;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{
    ApprovalDecision, Escalation, OverseerError, OverseerResult, Severity, TaskStatus,
};
use overseer_store::{ApprovalStore, EscalationStore, TaskFilter, TaskStore};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Raises escalations with a per-condition cooldown.
#[derive(Clone)]
pub struct Escalator {
    store: Arc<dyn EscalationStore>,
    cooldown: Duration,
}

impl Escalator {
    /// Escalator that suppresses repeats within `cooldown`.
    pub fn new(store: Arc<dyn EscalationStore>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    /// Raise unless the same `dedupe_key` was raised within the cooldown.
    /// Returns the stored record, or `None` when suppressed.
    pub async fn raise(&self, escalation: Escalation) -> OverseerResult<Option<Escalation>> {
        self.store.raise_escalation(&escalation, self.cooldown).await
    }

    /// Like [`Escalator::raise`], but a failure to record is only logged.
    /// Used on paths where the escalation is secondary to the state change
    /// that already happened.
    pub async fn raise_logged(&self, escalation: Escalation) {
        let key = escalation.dedupe_key.clone();
        if let Err(e) = self.raise(escalation).await {
            tracing::error!(key = %key, error = %e, "Failed to record escalation");
        }
    }
}

/// Counts from one escalation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    /// Expired requests whose default was approve.
    pub auto_approved: usize,
    /// Expired requests whose default was reject.
    pub auto_rejected: usize,
    /// Stuck tasks newly escalated (cooldown-suppressed ones excluded).
    pub stuck_escalated: usize,
}

/// Periodic sweep over approvals past their deadline and tasks stuck in
/// progress.
pub struct EscalationManager {
    tasks: Arc<dyn TaskStore>,
    approvals: Arc<dyn ApprovalStore>,
    gate: Arc<ApprovalGate>,
    escalator: Escalator,
    stuck_threshold: Duration,
}

impl EscalationManager {
    /// Manager that flags tasks running longer than `stuck_threshold`.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        approvals: Arc<dyn ApprovalStore>,
        gate: Arc<ApprovalGate>,
        escalator: Escalator,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            tasks,
            approvals,
            gate,
            escalator,
            stuck_threshold,
        }
    }

    /// Expires overdue approvals and escalates stuck tasks.
    pub async fn sweep(&self, now: DateTime<Utc>) -> OverseerResult<EscalationReport> {
        let mut report = EscalationReport::default();
        self.expire_approvals(now, &mut report).await?;
        self.escalate_stuck(now, &mut report).await?;
        if report != EscalationReport::default() {
            tracing::info!(
                auto_approved = report.auto_approved,
                auto_rejected = report.auto_rejected,
                stuck_escalated = report.stuck_escalated,
                "Escalation sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire_approvals(
        &self,
        now: DateTime<Utc>,
        report: &mut EscalationReport,
    ) -> OverseerResult<()> {
        for request in self.approvals.expired_approvals(now).await? {
            let (decided, task) = match self.gate.expire(&request, now).await {
                Ok(pair) => pair,
                // another sweeper or a reviewer got there first
                Err(OverseerError::Conflict(msg)) => {
                    tracing::debug!(
                        approval_id = %request.id,
                        reason = %msg,
                        "Approval already decided"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let applied = decided.applied_default.unwrap_or(ApprovalDecision::Rejected);
            if applied == ApprovalDecision::Approved {
                report.auto_approved += 1;
            } else {
                report.auto_rejected += 1;
            }
            self.escalator
                .raise_logged(
                    Escalation::new(
                        format!("approval_expired:{}", request.id),
                        Severity::Warning,
                        format!(
                            "approval for {} risk task expired undecided; applied default {}",
                            request.risk_level,
                            applied.as_str()
                        ),
                    )
                    .for_task(task.id)
                    .from_source("escalation")
                    .at(now),
                )
                .await;
        }
        Ok(())
    }

    async fn escalate_stuck(
        &self,
        now: DateTime<Utc>,
        report: &mut EscalationReport,
    ) -> OverseerResult<()> {
        let filter = TaskFilter::default()
            .with_status(TaskStatus::InProgress)
            .started_before(now - self.stuck_threshold);
        for task in self.tasks.list_tasks(&filter).await? {
            let age = task.started_at.map_or(self.stuck_threshold, |s| now - s);
            let raised = self
                .escalator
                .raise(
                    Escalation::new(
                        stuck_key(task.id),
                        Severity::Critical,
                        format!(
                            "task '{}' in progress on {} for {}s",
                            task.title,
                            task.assigned_worker.as_deref().unwrap_or("nobody"),
                            age.num_seconds()
                        ),
                    )
                    .for_task(task.id)
                    .from_source("escalation")
                    .at(now),
                )
                .await?;
            if raised.is_some() {
                report.stuck_escalated += 1;
            }
        }
        Ok(())
    }
}

fn stuck_key(task_id: Uuid) -> String {
    format!("stuck:{task_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use overseer_core::EscalationStatus;
    use overseer_store::SqliteStore;

    #[tokio::test]
    async fn test_escalator_cooldown() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let escalator = Escalator::new(store.clone(), Duration::minutes(10));
        let t0 = Utc::now();
        assert!(escalator
            .raise(Escalation::new("k", Severity::High, "first").at(t0))
            .await
            .unwrap()
            .is_some());
        assert!(escalator
            .raise(Escalation::new("k", Severity::High, "again").at(t0 + Duration::minutes(1)))
            .await
            .unwrap()
            .is_none());
        let open = store.list_escalations(Some(EscalationStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reason, "first");
    }

    #[test]
    fn test_stuck_key_is_per_task() {
        let id = Uuid::new_v4();
        assert_eq!(stuck_key(id), format!("stuck:{id}"));
    }
}
