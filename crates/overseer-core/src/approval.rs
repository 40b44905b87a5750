//! Approval types for human-in-the-loop sign-off.
//!
//! A task that requires approval (or whose risk exceeds the configured
//! threshold) is parked in `waiting_approval` with one [`ApprovalRequest`]
//! until a reviewer decides or the request expires.

use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Risk level attached to a task and its approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Routine change; never gated on its own.
    Low,
    /// Noticeable impact if it goes wrong.
    Medium,
    /// Hard to undo.
    High,
    /// Irreversible or externally visible.
    Critical,
}

impl RiskLevel {
    /// Lenient parse used for free-form producer input: unknown values map to
    /// `Medium`.
    pub fn parse_level(s: &str) -> Self {
        s.parse().unwrap_or(RiskLevel::Medium)
    }

    /// Lowercase name used in storage and on the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(OverseerError::Validation(format!("unknown risk level '{other}'"))),
        }
    }
}

/// Decision state of an [`ApprovalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// No decision yet.
    Pending,
    /// Signed off; the task may run.
    Approved,
    /// Turned down; the task is rejected.
    Rejected,
    /// Timed out; the configured default was applied.
    Expired,
}

impl ApprovalDecision {
    /// Stored name of the decision.
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Pending => "pending",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::Expired => "expired",
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalDecision::Pending),
            "approved" => Ok(ApprovalDecision::Approved),
            "rejected" => Ok(ApprovalDecision::Rejected),
            "expired" => Ok(ApprovalDecision::Expired),
            other => Err(OverseerError::Validation(format!("unknown approval decision '{other}'"))),
        }
    }
}

/// A request for human sign-off on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id.
    pub id: Uuid,
    /// Task waiting on this request.
    pub task_id: Uuid,
    /// Risk of the task when the request was opened.
    pub risk_level: RiskLevel,
    /// Current decision.
    pub decision: ApprovalDecision,
    /// For expired requests: the default policy that was applied
    /// (`Approved` or `Rejected`).
    pub applied_default: Option<ApprovalDecision>,
    /// Reviewer's stated reason.
    pub reason: Option<String>,
    /// Who decided.
    pub reviewer: Option<String>,
    /// When the request was opened.
    pub created_at: DateTime<Utc>,
    /// Deadline after which the default decision applies.
    pub expires_at: DateTime<Utc>,
    /// When a decision was recorded.
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Opens a pending request for `task_id`.
    pub fn new(
        task_id: Uuid,
        risk_level: RiskLevel,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            risk_level,
            decision: ApprovalDecision::Pending,
            applied_default: None,
            reason: None,
            reviewer: None,
            created_at,
            expires_at,
            decided_at: None,
        }
    }

    /// Whether the request is still undecided past its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.decision == ApprovalDecision::Pending && self.expires_at <= now
    }

    /// Whether the task this request guards may proceed to execution.
    pub fn permits_execution(&self) -> bool {
        match self.decision {
            ApprovalDecision::Approved => true,
            ApprovalDecision::Expired => self.applied_default == Some(ApprovalDecision::Approved),
            ApprovalDecision::Pending | ApprovalDecision::Rejected => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_parse_level_lenient() {
        assert_eq!(RiskLevel::parse_level("HIGH"), RiskLevel::High);
        assert_eq!(RiskLevel::parse_level("bogus"), RiskLevel::Medium);
        assert!("bogus".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let req =
            ApprovalRequest::new(Uuid::new_v4(), RiskLevel::High, now, now + Duration::minutes(60));
        assert!(!req.is_expired(now));
        assert!(req.is_expired(now + Duration::minutes(61)));
    }

    #[test]
    fn test_permits_execution() {
        let now = Utc::now();
        let mut req = ApprovalRequest::new(Uuid::new_v4(), RiskLevel::Low, now, now);
        assert!(!req.permits_execution());
        req.decision = ApprovalDecision::Approved;
        assert!(req.permits_execution());
        req.decision = ApprovalDecision::Expired;
        req.applied_default = Some(ApprovalDecision::Rejected);
        assert!(!req.permits_execution());
        req.applied_default = Some(ApprovalDecision::Approved);
        assert!(req.permits_execution());
    }
}
