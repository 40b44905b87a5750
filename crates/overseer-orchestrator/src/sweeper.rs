//! Periodic sweeps: escalation, worker health, scheduler tick, blocked-task
//! re-evaluation and retry housekeeping.
//!
//! Each sweep is independent. One failing is logged and escalated and does
//! not stop the others.

use crate::engine::Orchestrator;
use crate::escalation::EscalationReport;
use crate::health::HealthReport;
use crate::scheduler::TickReport;
use chrono::{DateTime, Utc};
use overseer_core::{Escalation, OverseerResult, Severity};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Which periodic job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    /// Approval expiry and stuck-task escalation.
    Escalation,
    /// Stale-worker detection and reclaim.
    Health,
    /// Recurring task generation.
    Scheduler,
    /// Blocked-task re-evaluation.
    Blocked,
    /// Dead-lettering of exhausted failures left behind.
    Retry,
}

impl SweepKind {
    /// Every sweep, in the order [`sweep_all`] runs them.
    pub const ALL: [SweepKind; 5] = [
        SweepKind::Escalation,
        SweepKind::Health,
        SweepKind::Scheduler,
        SweepKind::Blocked,
        SweepKind::Retry,
    ];

    /// Name used in logs and escalation keys.
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Escalation => "escalation",
            SweepKind::Health => "health",
            SweepKind::Scheduler => "scheduler",
            SweepKind::Blocked => "blocked",
            SweepKind::Retry => "retry",
        }
    }

    /// Run interval from the orchestrator's configuration. Blocked-task
    /// re-evaluation follows the budget sweep and retry housekeeping the
    /// health sweep.
    pub fn interval(self, orchestrator: &Orchestrator) -> Duration {
        let config = orchestrator.config();
        let secs = match self {
            SweepKind::Escalation => config.escalation.sweep_interval_secs,
            SweepKind::Health | SweepKind::Retry => config.health.sweep_interval_secs,
            SweepKind::Scheduler => config.scheduler.tick_interval_secs,
            SweepKind::Blocked => config.budget.sweep_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Combined result of [`sweep_all`]. A `None` section failed; its error is
/// listed in `failures`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Approval and stuck-task sweep, if it ran.
    pub escalation: Option<EscalationReport>,
    /// Worker health sweep, if it ran.
    pub health: Option<HealthReport>,
    /// Schedule tick, if it ran.
    pub scheduler: Option<TickReport>,
    /// Blocked tasks returned to the queue.
    pub unblocked: Option<usize>,
    /// Exhausted failures parked by housekeeping.
    pub dead_lettered: Option<usize>,
    /// Sweeps that errored, with their messages.
    pub failures: Vec<(SweepKind, String)>,
}

/// Run every sweep once, in a fixed order.
pub async fn sweep_all(orchestrator: &Orchestrator, now: DateTime<Utc>) -> SweepReport {
    let mut failures = Vec::new();
    let escalation = guarded(
        orchestrator,
        SweepKind::Escalation,
        now,
        &mut failures,
        orchestrator.escalations().sweep(now),
    )
    .await;
    let health = guarded(
        orchestrator,
        SweepKind::Health,
        now,
        &mut failures,
        orchestrator.health().sweep(now),
    )
    .await;
    let scheduler = guarded(
        orchestrator,
        SweepKind::Scheduler,
        now,
        &mut failures,
        orchestrator.scheduler().tick(now),
    )
    .await;
    let unblocked = guarded(
        orchestrator,
        SweepKind::Blocked,
        now,
        &mut failures,
        orchestrator.sweep_blocked(now),
    )
    .await;
    let dead_lettered = guarded(
        orchestrator,
        SweepKind::Retry,
        now,
        &mut failures,
        orchestrator.retry().housekeeping(now),
    )
    .await;
    SweepReport {
        escalation,
        health,
        scheduler,
        unblocked,
        dead_lettered,
        failures,
    }
}

/// Run one sweep, discarding its report.
pub async fn run_sweep(
    orchestrator: &Orchestrator,
    kind: SweepKind,
    now: DateTime<Utc>,
) -> OverseerResult<()> {
    match kind {
        SweepKind::Escalation => orchestrator.escalations().sweep(now).await.map(drop),
        SweepKind::Health => orchestrator.health().sweep(now).await.map(drop),
        SweepKind::Scheduler => orchestrator.scheduler().tick(now).await.map(drop),
        SweepKind::Blocked => orchestrator.sweep_blocked(now).await.map(drop),
        SweepKind::Retry => orchestrator.retry().housekeeping(now).await.map(drop),
    }
}

async fn guarded<T>(
    orchestrator: &Orchestrator,
    kind: SweepKind,
    now: DateTime<Utc>,
    failures: &mut Vec<(SweepKind, String)>,
    sweep: impl Future<Output = OverseerResult<T>>,
) -> Option<T> {
    match sweep.await {
        Ok(value) => Some(value),
        Err(e) => {
            report_failure(orchestrator, kind, &e.to_string(), now).await;
            failures.push((kind, e.to_string()));
            None
        }
    }
}

async fn report_failure(
    orchestrator: &Orchestrator,
    kind: SweepKind,
    message: &str,
    now: DateTime<Utc>,
) {
    error!(sweep = kind.as_str(), error = %message, "Sweep failed");
    let escalation = Escalation::new(
        format!("sweep_failed:{}", kind.as_str()),
        Severity::High,
        format!("{} sweep failed: {message}", kind.as_str()),
    )
    .from_source("sweeper")
    .at(now);
    orchestrator.escalator().raise_logged(escalation).await;
}

/// Start one interval loop per sweep. Each loop stops when `shutdown`
/// flips to `true` or its sender is dropped.
pub fn spawn_sweeps(
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    SweepKind::ALL
        .into_iter()
        .map(|kind| {
            let orchestrator = orchestrator.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let period = kind.interval(&orchestrator);
                let mut interval = tokio::time::interval(period);
                info!(
                    sweep = kind.as_str(),
                    interval_secs = period.as_secs(),
                    "Sweep loop started"
                );
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let now = Utc::now();
                            if let Err(e) = run_sweep(&orchestrator, kind, now).await {
                                report_failure(&orchestrator, kind, &e.to_string(), now)
                                    .await;
                            }
                        }
                        _ = shutdown.changed() => {
                            info!(sweep = kind.as_str(), "Shutdown signal, stopping sweep loop");
                            break;
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OverseerConfig;
    use crate::dispatch::HandlerRegistry;
    use crate::stores::Stores;
    use async_trait::async_trait;
    use overseer_core::{EscalationStatus, OverseerError, ScheduledTaskDefinition};
    use overseer_store::{EscalationStore, ScheduleOutcome, ScheduleStore, SqliteStore};
    use uuid::Uuid;

    /// Schedule store that is always down.
    struct DownSchedules;

    #[async_trait]
    impl ScheduleStore for DownSchedules {
        async fn insert_schedule(&self, _: &ScheduledTaskDefinition) -> OverseerResult<bool> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn get_schedule(&self, _: &str) -> OverseerResult<Option<ScheduledTaskDefinition>> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn list_schedules(&self) -> OverseerResult<Vec<ScheduledTaskDefinition>> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn due_schedules(
            &self,
            _: DateTime<Utc>,
        ) -> OverseerResult<Vec<ScheduledTaskDefinition>> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn advance_schedule(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<Uuid>,
            _: DateTime<Utc>,
        ) -> OverseerResult<bool> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn set_schedule_enabled(
            &self,
            _: &str,
            _: bool,
        ) -> OverseerResult<ScheduledTaskDefinition> {
            Err(OverseerError::Store("unavailable".into()))
        }
        async fn record_schedule_outcome(
            &self,
            _: &str,
            _: bool,
            _: &str,
        ) -> OverseerResult<ScheduleOutcome> {
            Err(OverseerError::Store("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_sweep_all_on_empty_store() {
        let orch = Orchestrator::new(
            Stores::from_sqlite(SqliteStore::open_in_memory().unwrap()),
            OverseerConfig::default(),
            HandlerRegistry::new(),
        );
        let report = sweep_all(&orch, Utc::now()).await;
        assert!(report.failures.is_empty());
        assert_eq!(report.escalation, Some(EscalationReport::default()));
        assert_eq!(report.health, Some(HealthReport::default()));
        assert_eq!(report.unblocked, Some(0));
        assert_eq!(report.dead_lettered, Some(0));
    }

    #[tokio::test]
    async fn test_failed_sweep_escalates_and_others_continue() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut stores = Stores::from_sqlite(SqliteStore::open_in_memory().unwrap());
        stores.escalations = store.clone();
        stores.schedules = Arc::new(DownSchedules);
        let orch = Orchestrator::new(stores, OverseerConfig::default(), HandlerRegistry::new());

        let report = sweep_all(&orch, Utc::now()).await;
        assert!(report.scheduler.is_none());
        assert!(report.health.is_some());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, SweepKind::Scheduler);

        let open = store.list_escalations(Some(EscalationStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].dedupe_key, "sweep_failed:scheduler");
        assert_eq!(open[0].source.as_deref(), Some("sweeper"));

        // the cooldown keeps a repeated failure from raising again
        sweep_all(&orch, Utc::now()).await;
        assert_eq!(store.list_escalations(None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_intervals_follow_config() {
        let orch = Orchestrator::new(
            Stores::from_sqlite(SqliteStore::open_in_memory().unwrap()),
            OverseerConfig::default(),
            HandlerRegistry::new(),
        );
        assert_eq!(SweepKind::Health.interval(&orch), Duration::from_secs(30));
        assert_eq!(SweepKind::Escalation.interval(&orch), Duration::from_secs(60));
        assert_eq!(SweepKind::Scheduler.interval(&orch), Duration::from_secs(30));
    }
}
