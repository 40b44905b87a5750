//! Fail-closed evaluation shared by every pre-dispatch gate.
//!
//! A gate answers allow or deny. When the answer cannot be computed (the
//! store errored) the result is always deny, and that mapping lives here
//! instead of at each call site.

use overseer_core::{OverseerError, OverseerResult};
use std::fmt;
use uuid::Uuid;

/// Which check produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Every `depends_on` entry completed.
    Dependency,
    /// Human sign-off.
    Approval,
    /// Period cost limits.
    Budget,
    /// Cost allocation bookkeeping.
    Allocation,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gate::Dependency => "dependency",
            Gate::Approval => "approval",
            Gate::Budget => "budget",
            Gate::Allocation => "allocation",
        })
    }
}

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Execution may continue.
    Allow,
    /// Execution must not continue.
    Deny {
        /// Operator-facing explanation.
        reason: String,
        /// The check itself failed, as opposed to answering "no".
        inconclusive: bool,
    },
}

impl GateDecision {
    /// A definitive denial.
    pub fn deny(reason: impl Into<String>) -> Self {
        GateDecision::Deny {
            reason: reason.into(),
            inconclusive: false,
        }
    }

    /// Whether execution may continue.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Collapse a fallible check into a decision; errors deny.
pub fn fail_closed(
    gate: Gate,
    task_id: Uuid,
    result: OverseerResult<GateDecision>,
) -> GateDecision {
    match result {
        Ok(decision) => decision,
        Err(e) => GateDecision::Deny {
            reason: inconclusive(gate, task_id, &e),
            inconclusive: true,
        },
    }
}

/// Log a check that could not be evaluated and return the denial reason.
pub fn inconclusive(gate: Gate, task_id: Uuid, error: &OverseerError) -> String {
    tracing::warn!(
        task_id = %task_id,
        gate = %gate,
        error = %error,
        "Gate check could not be evaluated, denying"
    );
    format!("{gate} check could not be evaluated: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_denies() {
        let decision = fail_closed(
            Gate::Budget,
            Uuid::nil(),
            Err(OverseerError::Store("database is locked".into())),
        );
        match decision {
            GateDecision::Deny { reason, inconclusive } => {
                assert!(inconclusive);
                assert!(reason.starts_with("budget check"));
            }
            GateDecision::Allow => panic!("store failure must deny"),
        }
    }

    #[test]
    fn test_answers_pass_through() {
        assert!(fail_closed(Gate::Dependency, Uuid::nil(), Ok(GateDecision::Allow)).is_allowed());
        assert_eq!(
            fail_closed(Gate::Dependency, Uuid::nil(), Ok(GateDecision::deny("waiting"))),
            GateDecision::deny("waiting")
        );
    }
}
