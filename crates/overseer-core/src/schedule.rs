use crate::task::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How often a scheduled definition fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    /// Cron expression with a leading seconds field, e.g. `0 */5 * * * *`.
    Cron(String),
    /// Fixed interval in seconds.
    Interval(u64),
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recurrence::Cron(expr) => write!(f, "cron '{expr}'"),
            Recurrence::Interval(secs) => write!(f, "every {secs}s"),
        }
    }
}

/// A recurring piece of work that the scheduler materialises into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskDefinition {
    /// Unique definition name.
    pub name: String,
    /// Type of the generated tasks.
    pub task_type: String,
    /// Title of the generated tasks.
    pub title: String,
    /// Payload copied into each generated task.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Priority of the generated tasks.
    #[serde(default)]
    pub priority: Priority,
    /// When runs happen.
    pub recurrence: Recurrence,
    /// Next time a task is due.
    pub next_run_at: DateTime<Utc>,
    /// Last time a task was generated.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent generated task that finished.
    pub last_run_status: Option<String>,
    /// Most recently generated task.
    pub last_task_id: Option<Uuid>,
    /// Failed runs since the last success.
    pub consecutive_failures: u32,
    /// Disable after this many consecutive failed runs.
    pub max_consecutive_failures: u32,
    /// Disabled definitions are never ticked.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTaskDefinition {
    /// Enabled definition first due at `next_run_at`.
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        recurrence: Recurrence,
        next_run_at: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            task_type: task_type.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            recurrence,
            next_run_at,
            last_run_at: None,
            last_run_status: None,
            last_task_id: None,
            consecutive_failures: 0,
            max_consecutive_failures: 5,
            enabled: true,
        }
    }

    /// Idempotency key of the task generated for the run due at `scheduled_for`.
    pub fn run_key(&self, scheduled_for: DateTime<Utc>) -> String {
        format!("schedule:{}@{}", self.name, scheduled_for.timestamp_millis())
    }

    /// True when enabled and the next run has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_run_key_is_stable_per_window() {
        let at = Utc::now();
        let def = ScheduledTaskDefinition::new("nightly", "report", Recurrence::Interval(60), at);
        assert_eq!(def.run_key(at), def.run_key(at));
        assert_ne!(def.run_key(at), def.run_key(at + Duration::seconds(60)));
    }

    #[test]
    fn test_is_due_respects_enabled() {
        let now = Utc::now();
        let mut def = ScheduledTaskDefinition::new("n", "report", Recurrence::Interval(60), now);
        assert!(def.is_due(now));
        assert!(!def.is_due(now - Duration::seconds(1)));
        def.enabled = false;
        assert!(!def.is_due(now));
    }
}
