//! TOML configuration for workers, sweeps and gates.
//!
//! Every section and field has a serde default, so an empty file (or no file
//! at all) yields a working configuration.

use crate::dispatch::EvidencePolicy;
use crate::scheduler::Scheduler;
use overseer_core::{
    BudgetLimits, OverseerError, OverseerResult, Priority, Recurrence, RiskLevel,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, one field per TOML section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverseerConfig {
    /// `[store]`
    #[serde(default)]
    pub store: StoreConfig,
    /// `[worker]`
    #[serde(default)]
    pub worker: WorkerConfig,
    /// `[retry]`
    #[serde(default)]
    pub retry: RetryConfig,
    /// `[approval]`
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// `[escalation]`
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// `[health]`
    #[serde(default)]
    pub health: HealthConfig,
    /// `[budget]`
    #[serde(default)]
    pub budget: BudgetConfig,
    /// `[scheduler]`
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// `[evidence]`: evidence policy per task type.
    #[serde(default)]
    pub evidence: HashMap<String, EvidencePolicy>,
    /// `[[schedules]]`: recurring definitions seeded at startup.
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

/// Durable store location.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file shared by every worker.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// How long a connection waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Task handler used for types with no registered handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackHandler {
    /// Unmatched types are released back to the queue.
    #[default]
    None,
    /// Unmatched types complete with their payload as evidence.
    Echo,
}

/// Worker polling loop.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between claim attempts when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-task handler timeout; a timed-out task is treated as failed.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Heartbeat period.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Candidates fetched per selection round.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,
    /// Re-selections after a batch is fully lost to other workers.
    #[serde(default = "default_max_claim_rounds")]
    pub max_claim_rounds: usize,
    /// Fallback for task types with no registered handler.
    #[serde(default)]
    pub fallback_handler: FallbackHandler,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            handler_timeout_secs: default_handler_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            claim_batch: default_claim_batch(),
            max_claim_rounds: default_max_claim_rounds(),
            fallback_handler: FallbackHandler::default(),
        }
    }
}

impl WorkerConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Retry and dead-letter behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// `max_attempts` given to submitted tasks that do not set one.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// First retry delay.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on the retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Keep the failing worker off the task for `reassign_window_secs`.
    #[serde(default = "default_true")]
    pub reassign_to_different_worker: bool,
    /// Length of the avoid window.
    #[serde(default = "default_reassign_window_secs")]
    pub reassign_window_secs: u64,
    /// Operator requeues allowed per dead-letter entry.
    #[serde(default = "default_dead_letter_max_retries")]
    pub dead_letter_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            reassign_to_different_worker: true,
            reassign_window_secs: default_reassign_window_secs(),
            dead_letter_max_retries: default_dead_letter_max_retries(),
        }
    }
}

/// Approval gate.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Tasks above this risk need sign-off even if not flagged.
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: RiskLevel,
    /// Time a request stays open before the expiry default applies.
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
    /// Expired requests at or below this risk are approved, the rest rejected.
    /// `None` rejects every expired request.
    #[serde(default = "default_auto_approve_up_to")]
    pub auto_approve_up_to: Option<RiskLevel>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            risk_threshold: default_risk_threshold(),
            expiry_minutes: default_expiry_minutes(),
            auto_approve_up_to: default_auto_approve_up_to(),
        }
    }
}

/// Escalation sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    /// Sweep period.
    #[serde(default = "default_escalation_interval_secs")]
    pub sweep_interval_secs: u64,
    /// An in-progress task older than this is escalated as stuck.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Minimum gap between escalations for the same condition.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_escalation_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Worker health sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Sweep period.
    #[serde(default = "default_health_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Heartbeat age after which a worker is offline.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_health_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Budget sweep and global limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Period of the blocked-task re-evaluation sweep.
    #[serde(default = "default_budget_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Global daily limit, seeded when the store has none.
    #[serde(default)]
    pub daily_limit: Option<f64>,
    /// Global weekly limit.
    #[serde(default)]
    pub weekly_limit: Option<f64>,
    /// Global monthly limit.
    #[serde(default)]
    pub monthly_limit: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_budget_interval_secs(),
            daily_limit: None,
            weekly_limit: None,
            monthly_limit: None,
        }
    }
}

impl BudgetConfig {
    /// Configured global limits.
    pub fn global_limits(&self) -> BudgetLimits {
        BudgetLimits {
            daily: self.daily_limit,
            weekly: self.weekly_limit,
            monthly: self.monthly_limit,
        }
    }
}

/// Scheduler tick.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Tick period.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Consecutive failed runs after which a definition is disabled.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// One `[[schedules]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Unique definition name.
    pub name: String,
    /// Type of the generated tasks.
    pub task_type: String,
    /// Title of the generated tasks; defaults to the name.
    #[serde(default)]
    pub title: Option<String>,
    /// Cron expression (seconds field first).
    #[serde(default)]
    pub cron: Option<String>,
    /// Fixed interval in seconds.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Priority of the generated tasks.
    #[serde(default)]
    pub priority: Priority,
    /// Payload of the generated tasks.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ScheduleConfig {
    /// The recurrence rule, requiring exactly one of `cron` / `interval_secs`.
    pub fn recurrence(&self) -> OverseerResult<Recurrence> {
        match (&self.cron, self.interval_secs) {
            (Some(expr), None) => Ok(Recurrence::Cron(expr.clone())),
            (None, Some(secs)) if secs > 0 => Ok(Recurrence::Interval(secs)),
            (None, Some(_)) => Err(OverseerError::Config(format!(
                "schedule '{}': interval_secs must be positive",
                self.name
            ))),
            _ => Err(OverseerError::Config(format!(
                "schedule '{}': set exactly one of cron or interval_secs",
                self.name
            ))),
        }
    }
}

/// Seconds as a chrono duration, saturating at ten years.
pub(crate) fn span_secs(secs: u64) -> chrono::Duration {
    const MAX_SECS: i64 = 10 * 366 * 24 * 3600;
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(MAX_SECS).min(MAX_SECS))
}

/// Milliseconds as a chrono duration, saturating at ten years.
pub(crate) fn span_millis(millis: u64) -> chrono::Duration {
    const MAX_MILLIS: i64 = 10 * 366 * 24 * 3600 * 1000;
    chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(MAX_MILLIS).min(MAX_MILLIS))
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/overseer.db")
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_handler_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_claim_batch() -> usize {
    8
}
fn default_max_claim_rounds() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    overseer_core::DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_reassign_window_secs() -> u64 {
    120
}
fn default_dead_letter_max_retries() -> u32 {
    3
}
fn default_risk_threshold() -> RiskLevel {
    RiskLevel::High
}
fn default_expiry_minutes() -> u64 {
    60
}
fn default_auto_approve_up_to() -> Option<RiskLevel> {
    Some(RiskLevel::Low)
}
fn default_escalation_interval_secs() -> u64 {
    60
}
fn default_stuck_threshold_secs() -> u64 {
    3_600
}
fn default_cooldown_secs() -> u64 {
    900
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_stale_after_secs() -> u64 {
    90
}
fn default_budget_interval_secs() -> u64 {
    300
}
fn default_tick_interval_secs() -> u64 {
    30
}
fn default_max_consecutive_failures() -> u32 {
    5
}

impl OverseerConfig {
    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> OverseerResult<Self> {
        let config: OverseerConfig = toml::from_str(content)
            .map_err(|e| OverseerError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> OverseerResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config = Self::parse(&content)?;
                tracing::info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(OverseerError::Io(e)),
        }
    }

    /// Reject values no deployment can mean.
    pub fn validate(&self) -> OverseerResult<()> {
        let positive = [
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            ("worker.handler_timeout_secs", self.worker.handler_timeout_secs),
            ("worker.heartbeat_interval_secs", self.worker.heartbeat_interval_secs),
            ("worker.claim_batch", self.worker.claim_batch as u64),
            ("worker.max_claim_rounds", self.worker.max_claim_rounds as u64),
            ("retry.default_max_attempts", u64::from(self.retry.default_max_attempts)),
            ("retry.backoff_base_ms", self.retry.backoff_base_ms),
            ("approval.expiry_minutes", self.approval.expiry_minutes),
            ("escalation.sweep_interval_secs", self.escalation.sweep_interval_secs),
            ("escalation.stuck_threshold_secs", self.escalation.stuck_threshold_secs),
            ("health.sweep_interval_secs", self.health.sweep_interval_secs),
            ("health.stale_after_secs", self.health.stale_after_secs),
            ("budget.sweep_interval_secs", self.budget.sweep_interval_secs),
            ("scheduler.tick_interval_secs", self.scheduler.tick_interval_secs),
            (
                "scheduler.max_consecutive_failures",
                u64::from(self.scheduler.max_consecutive_failures),
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(OverseerError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(OverseerError::Config(
                "retry.backoff_max_ms must not be below retry.backoff_base_ms".into(),
            ));
        }
        if self.health.stale_after_secs <= self.worker.heartbeat_interval_secs {
            return Err(OverseerError::Config(
                "health.stale_after_secs must exceed worker.heartbeat_interval_secs".into(),
            ));
        }
        self.budget
            .global_limits()
            .validate()
            .map_err(|e| OverseerError::Config(e.to_string()))?;

        let mut names = std::collections::HashSet::new();
        for schedule in &self.schedules {
            if !names.insert(schedule.name.as_str()) {
                return Err(OverseerError::Config(format!(
                    "duplicate schedule name '{}'",
                    schedule.name
                )));
            }
            if let Recurrence::Cron(expr) = schedule.recurrence()? {
                Scheduler::parse_cron(&expr)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = OverseerConfig::parse("").unwrap();
        assert_eq!(config.worker.claim_batch, 8);
        assert_eq!(config.retry.default_max_attempts, 3);
        assert_eq!(config.approval.risk_threshold, RiskLevel::High);
        assert_eq!(config.approval.auto_approve_up_to, Some(RiskLevel::Low));
        assert_eq!(config.worker.fallback_handler, FallbackHandler::None);
        assert!(config.budget.global_limits().is_unlimited());
    }

    #[test]
    fn test_partial_sections() {
        let config = OverseerConfig::parse(
            r#"
            [worker]
            poll_interval_ms = 250
            fallback_handler = "echo"

            [approval]
            risk_threshold = "medium"

            [budget]
            daily_limit = 25.0

            [evidence]
            email = "non_empty"
            deploy = { require_fields = ["commit", "url"] }

            [[schedules]]
            name = "digest"
            task_type = "email"
            cron = "0 0 9 * * *"
            priority = "high"

            [[schedules]]
            name = "poll"
            task_type = "fetch"
            interval_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.worker.heartbeat_interval_secs, 15);
        assert_eq!(config.worker.fallback_handler, FallbackHandler::Echo);
        assert_eq!(config.approval.risk_threshold, RiskLevel::Medium);
        assert_eq!(config.budget.global_limits().daily, Some(25.0));
        assert_eq!(config.evidence.get("email"), Some(&EvidencePolicy::NonEmpty));
        assert_eq!(
            config.evidence.get("deploy"),
            Some(&EvidencePolicy::RequireFields(vec!["commit".into(), "url".into()]))
        );
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].priority, Priority::High);
        assert_eq!(config.schedules[1].recurrence().unwrap(), Recurrence::Interval(600));
    }

    #[test]
    fn test_rejects_zero_and_inconsistent_values() {
        assert!(OverseerConfig::parse("[worker]\nclaim_batch = 0").is_err());
        assert!(OverseerConfig::parse("[retry]\ndefault_max_attempts = 0").is_err());
        let inverted_backoff = "[retry]\nbackoff_base_ms = 10\nbackoff_max_ms = 5";
        assert!(OverseerConfig::parse(inverted_backoff).is_err());
        assert!(OverseerConfig::parse("[health]\nstale_after_secs = 10").is_err());
        assert!(OverseerConfig::parse("[budget]\nweekly_limit = -3.0").is_err());
    }

    #[test]
    fn test_rejects_bad_schedules() {
        let bad_cron = "[[schedules]]\nname = \"x\"\ntask_type = \"t\"\ncron = \"not a cron\"";
        assert!(matches!(
            OverseerConfig::parse(bad_cron).unwrap_err(),
            OverseerError::Config(_)
        ));
        let both = "[[schedules]]\nname = \"x\"\ntask_type = \"t\"\n\
                    cron = \"0 * * * * *\"\ninterval_secs = 5";
        assert!(OverseerConfig::parse(both).is_err());
        let dup = "[[schedules]]\nname = \"x\"\ntask_type = \"t\"\ninterval_secs = 5\n\
                   [[schedules]]\nname = \"x\"\ntask_type = \"t\"\ninterval_secs = 6";
        assert!(OverseerConfig::parse(dup).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OverseerConfig::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.store.busy_timeout_ms, 5_000);

        let path = dir.path().join("overseer.toml");
        tokio::fs::write(&path, "[store]\npath = \"/tmp/x.db\"").await.unwrap();
        let config = OverseerConfig::load(&path).await.unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/x.db"));
    }
}
