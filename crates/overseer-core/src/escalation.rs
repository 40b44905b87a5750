use crate::OverseerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How loudly an escalation should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Needs attention soon.
    Warning,
    /// Needs attention now.
    High,
    /// Work is stuck or lost without intervention.
    Critical,
}

impl Severity {
    /// Lowercase severity name.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(OverseerError::Validation(format!("unknown severity '{other}'"))),
        }
    }
}

/// Whether an operator has seen the escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    /// Not yet acknowledged.
    Open,
    /// Seen by an operator.
    Acknowledged,
}

impl EscalationStatus {
    /// Stored name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStatus::Open => "open",
            EscalationStatus::Acknowledged => "acknowledged",
        }
    }
}

impl FromStr for EscalationStatus {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(EscalationStatus::Open),
            "acknowledged" => Ok(EscalationStatus::Acknowledged),
            other => Err(OverseerError::Validation(format!("unknown escalation status '{other}'"))),
        }
    }
}

/// A raised-severity record for a condition an operator has to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Escalation id.
    pub id: Uuid,
    /// Identifies the underlying condition; repeats inside the cooldown window
    /// are suppressed.
    pub dedupe_key: String,
    /// Task it concerns, if any.
    pub task_id: Option<Uuid>,
    /// How urgent it is.
    pub severity: Severity,
    /// Component or actor that raised it.
    pub source: Option<String>,
    /// Human-readable description.
    pub reason: String,
    /// Open or acknowledged.
    pub status: EscalationStatus,
    /// When it was raised.
    pub created_at: DateTime<Utc>,
    /// When an operator acknowledged it.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Escalation {
    /// New open escalation raised now.
    pub fn new(
        dedupe_key: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dedupe_key: dedupe_key.into(),
            task_id: None,
            severity,
            source: None,
            reason: reason.into(),
            status: EscalationStatus::Open,
            created_at: Utc::now(),
            acknowledged_at: None,
        }
    }

    /// Links the escalation to a task.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Records who raised it.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Overrides the creation time.
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
