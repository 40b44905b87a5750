//! Human sign-off before risky tasks execute.

use crate::config::{span_secs, ApprovalConfig};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{
    ApprovalDecision, ApprovalRequest, OverseerError, OverseerResult, RiskLevel, Task,
};
use overseer_store::ApprovalStore;
use std::sync::Arc;
use uuid::Uuid;

/// When approval is needed and what happens when nobody answers.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    /// Unflagged tasks above this risk are gated.
    pub risk_threshold: RiskLevel,
    /// How long a request stays open.
    pub expiry: Duration,
    /// Expired requests up to this risk are approved; `None` rejects all.
    pub auto_approve_up_to: Option<RiskLevel>,
}

impl ApprovalPolicy {
    /// Policy from the `[approval]` config section.
    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self {
            risk_threshold: config.risk_threshold,
            expiry: span_secs(config.expiry_minutes.saturating_mul(60)),
            auto_approve_up_to: config.auto_approve_up_to,
        }
    }

    /// Flagged tasks and tasks whose risk exceeds the threshold.
    pub fn requires_approval(&self, task: &Task) -> bool {
        task.requires_approval || task.risk_level > self.risk_threshold
    }

    /// Decision applied to a request that expired undecided.
    pub fn expiry_default(&self, risk: RiskLevel) -> ApprovalDecision {
        match self.auto_approve_up_to {
            Some(ceiling) if risk <= ceiling => ApprovalDecision::Approved,
            _ => ApprovalDecision::Rejected,
        }
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::from_config(&ApprovalConfig::default())
    }
}

/// Result of running a claimed task through the gate.
#[derive(Debug, Clone)]
pub enum ApprovalCheck {
    /// No approval needed, or already granted.
    Proceed,
    /// The task is now `waiting_approval` behind this request.
    Parked(ApprovalRequest),
}

/// Opens, decides and expires approval requests.
pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    scheduler: Arc<Scheduler>,
    policy: ApprovalPolicy,
}

impl ApprovalGate {
    /// Gate over the approval store.
    pub fn new(
        approvals: Arc<dyn ApprovalStore>,
        scheduler: Arc<Scheduler>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            approvals,
            scheduler,
            policy,
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Gate an in-progress task held by `worker_id`.
    ///
    /// A task that needs approval proceeds only when its latest request
    /// permits execution; otherwise a new request is opened and the task is
    /// parked. Store errors propagate so the caller can fail closed.
    pub async fn check(
        &self,
        task: &Task,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<ApprovalCheck> {
        if !self.policy.requires_approval(task) {
            return Ok(ApprovalCheck::Proceed);
        }
        if let Some(latest) = self.approvals.latest_approval(task.id).await? {
            if latest.permits_execution() {
                tracing::debug!(
                    task_id = %task.id,
                    approval_id = %latest.id,
                    "Approval already granted"
                );
                return Ok(ApprovalCheck::Proceed);
            }
        }
        let request = ApprovalRequest::new(task.id, task.risk_level, now, now + self.policy.expiry);
        let request = self.approvals.open_approval(&request, worker_id).await?;
        tracing::info!(
            task_id = %task.id,
            approval_id = %request.id,
            risk = %request.risk_level,
            expires_at = %request.expires_at,
            "Task parked for approval"
        );
        Ok(ApprovalCheck::Parked(request))
    }

    /// Approve a pending request; its task re-enters the queue.
    pub async fn approve(
        &self,
        id: Uuid,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        let (request, task) = self
            .approvals
            .decide_approval(id, ApprovalDecision::Approved, None, reviewer, reason, now)
            .await?;
        tracing::info!(
            approval_id = %id,
            task_id = %task.id,
            reviewer = reviewer.unwrap_or("-"),
            "Approval granted"
        );
        Ok((request, task))
    }

    /// Reject a pending request; its task becomes terminally rejected.
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        let (request, task) = self
            .approvals
            .decide_approval(id, ApprovalDecision::Rejected, None, reviewer, reason, now)
            .await?;
        tracing::info!(
            approval_id = %id,
            task_id = %task.id,
            reviewer = reviewer.unwrap_or("-"),
            "Approval rejected"
        );
        self.after_rejection(&task).await;
        Ok((request, task))
    }

    /// Apply the configured default to an expired request. A request that
    /// was decided meanwhile yields `Conflict`.
    pub async fn expire(
        &self,
        request: &ApprovalRequest,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        if !request.is_expired(now) {
            return Err(OverseerError::Conflict(format!(
                "approval {} has not expired",
                request.id
            )));
        }
        let default = self.policy.expiry_default(request.risk_level);
        let (decided, task) = self
            .approvals
            .decide_approval(
                request.id,
                ApprovalDecision::Expired,
                Some(default),
                None,
                None,
                now,
            )
            .await?;
        tracing::warn!(
            approval_id = %request.id,
            task_id = %task.id,
            risk = %request.risk_level,
            applied = default.as_str(),
            "Approval expired, default applied"
        );
        if default == ApprovalDecision::Rejected {
            self.after_rejection(&task).await;
        }
        Ok((decided, task))
    }

    async fn after_rejection(&self, task: &Task) {
        if let Err(e) = self.scheduler.record_outcome(task).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to record schedule outcome");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::escalation::Escalator;
    use overseer_core::TaskStatus;
    use overseer_store::{SqliteStore, TaskStore};

    fn gate(store: &Arc<SqliteStore>) -> ApprovalGate {
        let escalator = Escalator::new(store.clone(), Duration::minutes(15));
        let scheduler = Arc::new(Scheduler::new(store.clone(), store.clone(), escalator, 3, 5));
        ApprovalGate::new(store.clone(), scheduler, ApprovalPolicy::default())
    }

    async fn claimed(store: &SqliteStore, task: Task, now: DateTime<Utc>) -> Task {
        store.insert_task(&task).await.unwrap();
        assert!(store.try_claim(task.id, "w1", now).await.unwrap());
        store.get_task(task.id).await.unwrap().unwrap()
    }

    #[test]
    fn test_policy_threshold_and_defaults() {
        let policy = ApprovalPolicy::default();
        let at = |risk| Task::new("t", "x").with_risk_level(risk);
        assert!(!policy.requires_approval(&at(RiskLevel::Medium)));
        assert!(!policy.requires_approval(&at(RiskLevel::High)));
        assert!(policy.requires_approval(&at(RiskLevel::Critical)));
        assert!(policy.requires_approval(&Task::new("t", "x").with_approval(RiskLevel::Low)));

        assert_eq!(policy.expiry_default(RiskLevel::Low), ApprovalDecision::Approved);
        assert_eq!(policy.expiry_default(RiskLevel::Medium), ApprovalDecision::Rejected);
        let strict = ApprovalPolicy {
            auto_approve_up_to: None,
            ..ApprovalPolicy::default()
        };
        assert_eq!(strict.expiry_default(RiskLevel::Low), ApprovalDecision::Rejected);
    }

    #[tokio::test]
    async fn test_unflagged_task_at_threshold_proceeds_above_is_parked() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let gate = gate(&store);

        let high = Task::new("deploy", "at").with_risk_level(RiskLevel::High);
        let high = claimed(&store, high, now).await;
        assert!(matches!(gate.check(&high, "w1", now).await.unwrap(), ApprovalCheck::Proceed));

        let critical = Task::new("deploy", "above").with_risk_level(RiskLevel::Critical);
        let critical = claimed(&store, critical, now).await;
        let ApprovalCheck::Parked(request) = gate.check(&critical, "w1", now).await.unwrap() else {
            panic!("expected the critical task to be parked");
        };
        assert_eq!(request.task_id, critical.id);
        assert_eq!(request.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_unflagged_task_proceeds() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now() + Duration::seconds(1);
        let task = claimed(&store, Task::new("email", "x"), now).await;
        let check = gate(&store).check(&task, "w1", now).await.unwrap();
        assert!(matches!(check, ApprovalCheck::Proceed));
    }

    #[tokio::test]
    async fn test_park_approve_then_proceed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gate = gate(&store);
        let now = Utc::now() + Duration::seconds(1);
        let task = Task::new("deploy", "x").with_approval(RiskLevel::High);
        let task = claimed(&store, task, now).await;

        let ApprovalCheck::Parked(request) = gate.check(&task, "w1", now).await.unwrap() else {
            panic!("expected parking");
        };
        assert_eq!(
            request.expires_at.timestamp_millis(),
            (now + Duration::minutes(60)).timestamp_millis()
        );
        assert_eq!(
            store.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::WaitingApproval
        );

        let (decided, requeued) = gate.approve(request.id, Some("alice"), None, now).await.unwrap();
        assert_eq!(decided.decision, ApprovalDecision::Approved);
        assert_eq!(requeued.status, TaskStatus::Pending);

        let later = now + Duration::seconds(1);
        assert!(store.try_claim(task.id, "w2", later).await.unwrap());
        let reclaimed = store.get_task(task.id).await.unwrap().unwrap();
        let check = gate.check(&reclaimed, "w2", later).await.unwrap();
        assert!(matches!(check, ApprovalCheck::Proceed));
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gate = gate(&store);
        let now = Utc::now() + Duration::seconds(1);
        let task = Task::new("deploy", "x").with_approval(RiskLevel::Critical);
        let task = claimed(&store, task, now).await;
        let ApprovalCheck::Parked(request) = gate.check(&task, "w1", now).await.unwrap() else {
            panic!("expected parking");
        };
        let (_, rejected) = gate
            .reject(request.id, Some("bob"), Some("not today"), now)
            .await
            .unwrap();
        assert_eq!(rejected.status, TaskStatus::Rejected);
        assert_eq!(rejected.error_message.as_deref(), Some("not today"));
        assert!(matches!(
            gate.approve(request.id, None, None, now).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_expire_requires_deadline() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let gate = gate(&store);
        let now = Utc::now() + Duration::seconds(1);
        let task = Task::new("deploy", "x").with_approval(RiskLevel::Low);
        let task = claimed(&store, task, now).await;
        let ApprovalCheck::Parked(request) = gate.check(&task, "w1", now).await.unwrap() else {
            panic!("expected parking");
        };
        assert!(gate.expire(&request, now).await.is_err());

        let later = now + Duration::minutes(61);
        let (decided, task) = gate.expire(&request, later).await.unwrap();
        assert_eq!(decided.applied_default, Some(ApprovalDecision::Approved));
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
