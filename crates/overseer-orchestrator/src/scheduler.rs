use crate::config::ScheduleConfig;
use crate::escalation::Escalator;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use overseer_core::{
    Escalation, OverseerError, OverseerResult, Recurrence, ScheduledTaskDefinition, Severity,
    Task, TaskStatus,
};
use overseer_store::{InsertOutcome, ScheduleStore, TaskStore};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks inserted by this tick.
    pub generated: Vec<Uuid>,
    /// Due windows whose task already existed (another scheduler won).
    pub duplicates: usize,
    /// Definitions disabled because their recurrence could not be evaluated.
    pub disabled: Vec<String>,
}

/// Turns due [`ScheduledTaskDefinition`]s into queue entries.
///
/// Each due window produces at most one task: the generated task carries a
/// dedupe key derived from the definition name and the window's scheduled
/// time, and `next_run_at` only moves forward through a compare-and-set, so
/// any number of concurrent ticks agree on one task per window.
pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    schedules: Arc<dyn ScheduleStore>,
    escalator: Escalator,
    default_max_attempts: u32,
    max_consecutive_failures: u32,
}

impl Scheduler {
    /// Scheduler over the task and schedule stores. `default_max_attempts`
    /// applies to generated tasks; `max_consecutive_failures` to definitions
    /// built from config.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        schedules: Arc<dyn ScheduleStore>,
        escalator: Escalator,
        default_max_attempts: u32,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            tasks,
            schedules,
            escalator,
            default_max_attempts,
            max_consecutive_failures,
        }
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 6- or 7-field format with seconds first:
    /// sec min hour day-of-month month day-of-week [year].
    pub fn parse_cron(cron_expr: &str) -> OverseerResult<Schedule> {
        Schedule::from_str(cron_expr).map_err(|e| {
            OverseerError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_run_after(
        recurrence: &Recurrence,
        after: DateTime<Utc>,
    ) -> OverseerResult<DateTime<Utc>> {
        match recurrence {
            Recurrence::Cron(expr) => {
                Self::parse_cron(expr)?
                    .after(&after)
                    .next()
                    .ok_or_else(|| {
                        OverseerError::Config(format!(
                            "Cron expression '{expr}' has no upcoming fire times"
                        ))
                    })
            }
            Recurrence::Interval(0) => {
                Err(OverseerError::Config("interval recurrence must be positive".into()))
            }
            Recurrence::Interval(secs) => {
                let secs = i64::try_from(*secs)
                    .map_err(|_| OverseerError::Config(format!("interval {secs}s is too large")))?;
                Ok(after + Duration::seconds(secs))
            }
        }
    }

    /// Build a definition from a `[[schedules]]` entry, first due at the
    /// next fire time after `now`.
    pub fn definition_from_config(
        &self,
        config: &ScheduleConfig,
        now: DateTime<Utc>,
    ) -> OverseerResult<ScheduledTaskDefinition> {
        let recurrence = config.recurrence()?;
        let next = Self::next_run_after(&recurrence, now)?;
        let mut definition = ScheduledTaskDefinition::new(
            config.name.clone(),
            config.task_type.clone(),
            recurrence,
            next,
        );
        if let Some(title) = &config.title {
            definition.title = title.clone();
        }
        definition.priority = config.priority;
        definition.payload = config.payload.clone();
        definition.max_consecutive_failures = self.max_consecutive_failures;
        Ok(definition)
    }

    /// Store a new definition. `Ok(false)` when the name is taken.
    pub async fn add_definition(
        &self,
        definition: &ScheduledTaskDefinition,
    ) -> OverseerResult<bool> {
        if definition.name.trim().is_empty() || definition.task_type.trim().is_empty() {
            return Err(OverseerError::Validation(
                "schedule name and task type must not be empty".into(),
            ));
        }
        if definition.max_consecutive_failures == 0 {
            return Err(OverseerError::Validation(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        Self::next_run_after(&definition.recurrence, definition.next_run_at)
            .map_err(|e| OverseerError::Validation(e.to_string()))?;
        let inserted = self.schedules.insert_schedule(definition).await?;
        if inserted {
            tracing::info!(
                schedule = %definition.name,
                recurrence = %definition.recurrence,
                next_run_at = %definition.next_run_at,
                "Schedule added"
            );
        }
        Ok(inserted)
    }

    /// Materialise every due definition into one task and move its
    /// `next_run_at` past `now`. Missed windows are coalesced into one run.
    pub async fn tick(&self, now: DateTime<Utc>) -> OverseerResult<TickReport> {
        let mut report = TickReport::default();
        for definition in self.schedules.due_schedules(now).await? {
            let scheduled_for = definition.next_run_at;
            let next = match Self::next_run_after(&definition.recurrence, scheduled_for.max(now)) {
                Ok(next) => next,
                Err(e) => {
                    self.disable_unrunnable(&definition, &e, now).await?;
                    report.disabled.push(definition.name.clone());
                    continue;
                }
            };

            let task = self.generate(&definition, scheduled_for);
            let generated = match self.tasks.insert_task(&task).await? {
                InsertOutcome::Inserted => Some(task.id),
                InsertOutcome::Duplicate => None,
            };
            let advanced = self
                .schedules
                .advance_schedule(&definition.name, scheduled_for, next, generated, now)
                .await?;

            match generated {
                Some(id) => {
                    tracing::info!(
                        schedule = %definition.name,
                        task_id = %id,
                        scheduled_for = %scheduled_for,
                        next_run_at = %next,
                        "Scheduled task generated"
                    );
                    report.generated.push(id);
                }
                None => {
                    tracing::debug!(
                        schedule = %definition.name,
                        advanced,
                        "Window already materialised"
                    );
                    report.duplicates += 1;
                }
            }
        }
        Ok(report)
    }

    /// Feed a generated task's terminal status back into its definition.
    /// Completion resets the failure streak; dead-lettering and rejection
    /// extend it, and reaching the limit disables the definition.
    pub async fn record_outcome(&self, task: &Task) -> OverseerResult<()> {
        let Some(name) = task.schedule_name.as_deref() else {
            return Ok(());
        };
        let success = match task.status {
            TaskStatus::Completed => true,
            TaskStatus::DeadLettered | TaskStatus::Rejected => false,
            _ => return Ok(()),
        };
        let outcome = match self
            .schedules
            .record_schedule_outcome(name, success, task.status.as_str())
            .await
        {
            Ok(outcome) => outcome,
            Err(OverseerError::NotFound(_)) => {
                tracing::debug!(schedule = %name, task_id = %task.id, "Schedule no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if outcome.disabled_now {
            let def = &outcome.definition;
            tracing::warn!(
                schedule = %name,
                failures = def.consecutive_failures,
                "Schedule disabled after consecutive failures"
            );
            self.escalator
                .raise_logged(
                    Escalation::new(
                        format!("schedule_disabled:{name}"),
                        Severity::High,
                        format!(
                            "schedule '{name}' disabled after {} failed runs (last: {})",
                            def.consecutive_failures,
                            task.status
                        ),
                    )
                    .for_task(task.id)
                    .from_source("scheduler"),
                )
                .await;
        }
        Ok(())
    }

    fn generate(&self, definition: &ScheduledTaskDefinition, scheduled_for: DateTime<Utc>) -> Task {
        let mut task = Task::new(definition.task_type.clone(), definition.title.clone())
            .with_payload(definition.payload.clone())
            .with_priority(definition.priority)
            .with_max_attempts(self.default_max_attempts)
            .with_dedupe_key(definition.run_key(scheduled_for));
        task.schedule_name = Some(definition.name.clone());
        task
    }

    async fn disable_unrunnable(
        &self,
        definition: &ScheduledTaskDefinition,
        error: &OverseerError,
        now: DateTime<Utc>,
    ) -> OverseerResult<()> {
        tracing::warn!(
            schedule = %definition.name,
            error = %error,
            "Disabling schedule with invalid recurrence"
        );
        self.schedules.set_schedule_enabled(&definition.name, false).await?;
        self.escalator
            .raise_logged(
                Escalation::new(
                    format!("schedule_invalid:{}", definition.name),
                    Severity::High,
                    format!("schedule '{}' disabled: {error}", definition.name),
                )
                .from_source("scheduler")
                .at(now),
            )
            .await;
        Ok(())
    }
}
