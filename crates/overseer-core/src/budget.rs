//! Cost tracking types.
//!
//! Usage is not stored as counters; it is derived from
//! [`ResourceAllocation`] rows created since the start of each period, so a
//! new period "resets" usage without any sweep having to run.

use crate::OverseerError;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Rolling window a limit is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    /// Since midnight UTC.
    Daily,
    /// Since Monday midnight UTC.
    Weekly,
    /// Since the first of the month, UTC.
    Monthly,
}

impl BudgetPeriod {
    /// Every period, shortest first.
    pub const ALL: [BudgetPeriod; 3] =
        [BudgetPeriod::Daily, BudgetPeriod::Weekly, BudgetPeriod::Monthly];

    /// Lowercase period name.
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
        }
    }

    /// Start of the period containing `now`: UTC midnight, Monday 00:00 UTC,
    /// or the 1st of the month 00:00 UTC.
    pub fn start_of(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start = match self {
            BudgetPeriod::Daily => date,
            BudgetPeriod::Weekly => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            BudgetPeriod::Monthly => date.with_day(1).unwrap_or(date),
        };
        start.and_time(NaiveTime::MIN).and_utc()
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetPeriod {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(BudgetPeriod::Daily),
            "weekly" => Ok(BudgetPeriod::Weekly),
            "monthly" => Ok(BudgetPeriod::Monthly),
            other => Err(OverseerError::Validation(format!("unknown budget period '{other}'"))),
        }
    }
}

/// Whose spending a limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetScope {
    /// Shared by every worker.
    Global,
    /// A single worker, by id.
    Worker(String),
}

impl BudgetScope {
    /// Storage key: `global` or `worker:<id>`.
    pub fn key(&self) -> String {
        match self {
            BudgetScope::Global => "global".to_string(),
            BudgetScope::Worker(id) => format!("worker:{id}"),
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for BudgetScope {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(BudgetScope::Global);
        }
        match s.strip_prefix("worker:") {
            Some(id) if !id.is_empty() => Ok(BudgetScope::Worker(id.to_string())),
            _ => Err(OverseerError::Validation(format!(
                "budget scope must be 'global' or 'worker:<id>', got '{s}'"
            ))),
        }
    }
}

/// Per-period cost ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Daily cap.
    pub daily: Option<f64>,
    /// Weekly cap.
    pub weekly: Option<f64>,
    /// Monthly cap.
    pub monthly: Option<f64>,
}

impl BudgetLimits {
    /// Cap for `period`, if any.
    pub fn get(&self, period: BudgetPeriod) -> Option<f64> {
        match period {
            BudgetPeriod::Daily => self.daily,
            BudgetPeriod::Weekly => self.weekly,
            BudgetPeriod::Monthly => self.monthly,
        }
    }

    /// Replaces the cap for `period`; `None` removes it.
    pub fn set(&mut self, period: BudgetPeriod, limit: Option<f64>) {
        match period {
            BudgetPeriod::Daily => self.daily = limit,
            BudgetPeriod::Weekly => self.weekly = limit,
            BudgetPeriod::Monthly => self.monthly = limit,
        }
    }

    /// True when no period is capped.
    pub fn is_unlimited(&self) -> bool {
        self.daily.is_none() && self.weekly.is_none() && self.monthly.is_none()
    }

    /// Rejects negative or non-finite caps.
    pub fn validate(&self) -> Result<(), OverseerError> {
        for period in BudgetPeriod::ALL {
            if let Some(limit) = self.get(period) {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(OverseerError::Validation(format!(
                        "{period} limit must be a non-negative number, got {limit}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Spending recorded in each current period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Spent since the start of today.
    pub daily: f64,
    /// Spent since the start of the week.
    pub weekly: f64,
    /// Spent since the start of the month.
    pub monthly: f64,
}

impl BudgetUsage {
    /// Spend for `period`.
    pub fn get(&self, period: BudgetPeriod) -> f64 {
        match period {
            BudgetPeriod::Daily => self.daily,
            BudgetPeriod::Weekly => self.weekly,
            BudgetPeriod::Monthly => self.monthly,
        }
    }

    /// Overwrites the spend for `period`.
    pub fn set(&mut self, period: BudgetPeriod, value: f64) {
        match period {
            BudgetPeriod::Daily => self.daily = value,
            BudgetPeriod::Weekly => self.weekly = value,
            BudgetPeriod::Monthly => self.monthly = value,
        }
    }
}

/// Lifecycle of a cost reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Reserved at claim time.
    Allocated,
    /// Settled with the actual cost.
    Completed,
    /// Given back without being spent.
    Released,
}

impl AllocationStatus {
    /// Stored name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Allocated => "allocated",
            AllocationStatus::Completed => "completed",
            AllocationStatus::Released => "released",
        }
    }
}

impl FromStr for AllocationStatus {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(AllocationStatus::Allocated),
            "completed" => Ok(AllocationStatus::Completed),
            "released" => Ok(AllocationStatus::Released),
            other => Err(OverseerError::Validation(format!("unknown allocation status '{other}'"))),
        }
    }
}

/// Cost tracking for one execution of a task. Tracking only; enforcement is
/// the budget enforcer's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Allocation id.
    pub id: Uuid,
    /// Task the cost is reserved for.
    pub task_id: Uuid,
    /// Worker charged for it.
    pub worker_id: String,
    /// Reserved amount.
    pub estimated_cost: f64,
    /// Settled amount, once known.
    pub actual_cost: Option<f64>,
    /// Where the reservation stands.
    pub status: AllocationStatus,
    /// When it was reserved.
    pub created_at: DateTime<Utc>,
    /// When it was settled or released.
    pub finalized_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_starts() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 17, 42, 5).unwrap();
        assert_eq!(
            BudgetPeriod::Daily.start_of(now),
            Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetPeriod::Weekly.start_of(now),
            Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap()
        );
        assert_eq!(
            BudgetPeriod::Monthly.start_of(now),
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_weekly_start_on_monday_is_same_day() {
        let monday = Utc.with_ymd_and_hms(2026, 10, 12, 9, 0, 0).unwrap();
        assert_eq!(
            BudgetPeriod::Weekly.start_of(monday),
            Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(BudgetScope::Global.key(), "global");
        let scope: BudgetScope = "worker:w-7".parse().unwrap();
        assert_eq!(scope, BudgetScope::Worker("w-7".into()));
        assert_eq!(scope.key(), "worker:w-7");
        assert!("worker:".parse::<BudgetScope>().is_err());
        assert!("team:x".parse::<BudgetScope>().is_err());
    }

    #[test]
    fn test_limits_validation() {
        let mut limits = BudgetLimits::default();
        assert!(limits.is_unlimited());
        limits.set(BudgetPeriod::Weekly, Some(10.0));
        assert_eq!(limits.get(BudgetPeriod::Weekly), Some(10.0));
        assert!(limits.validate().is_ok());
        limits.set(BudgetPeriod::Daily, Some(-1.0));
        assert!(limits.validate().is_err());
    }
}
