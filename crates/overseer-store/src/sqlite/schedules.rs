use super::rows::{from_millis, opt_from_millis, parse_uuid, priority_from_rank, to_millis};
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::{ScheduleOutcome, ScheduleStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{OverseerError, OverseerResult, ScheduledTaskDefinition};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "name, task_type, title, payload, priority_rank, recurrence, \
     next_run_at, last_run_at, last_run_status, last_task_id, consecutive_failures, \
     max_consecutive_failures, enabled";

struct ScheduleRow {
    name: String,
    task_type: String,
    title: String,
    payload: String,
    priority_rank: i64,
    recurrence: String,
    next_run_at: i64,
    last_run_at: Option<i64>,
    last_run_status: Option<String>,
    last_task_id: Option<String>,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    enabled: bool,
}

fn schedule_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        name: row.get(0)?,
        task_type: row.get(1)?,
        title: row.get(2)?,
        payload: row.get(3)?,
        priority_rank: row.get(4)?,
        recurrence: row.get(5)?,
        next_run_at: row.get(6)?,
        last_run_at: row.get(7)?,
        last_run_status: row.get(8)?,
        last_task_id: row.get(9)?,
        consecutive_failures: row.get(10)?,
        max_consecutive_failures: row.get(11)?,
        enabled: row.get(12)?,
    })
}

impl ScheduleRow {
    fn into_definition(self) -> StoreResult<ScheduledTaskDefinition> {
        Ok(ScheduledTaskDefinition {
            name: self.name,
            task_type: self.task_type,
            title: self.title,
            payload: serde_json::from_str(&self.payload)?,
            priority: priority_from_rank(self.priority_rank)?,
            recurrence: serde_json::from_str(&self.recurrence)?,
            next_run_at: from_millis(self.next_run_at)?,
            last_run_at: opt_from_millis(self.last_run_at)?,
            last_run_status: self.last_run_status,
            last_task_id: self.last_task_id.as_deref().map(parse_uuid).transpose()?,
            consecutive_failures: self.consecutive_failures,
            max_consecutive_failures: self.max_consecutive_failures,
            enabled: self.enabled,
        })
    }
}

fn load(conn: &Connection, name: &str) -> StoreResult<Option<ScheduledTaskDefinition>> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_definitions WHERE name = ?1");
    conn.query_row(&sql, [name], schedule_row)
        .optional()?
        .map(ScheduleRow::into_definition)
        .transpose()
}

fn load_existing(conn: &Connection, name: &str) -> StoreResult<ScheduledTaskDefinition> {
    load(conn, name)?.ok_or_else(|| OverseerError::NotFound(format!("schedule '{name}'")).into())
}

fn query(
    conn: &Connection,
    clause: &str,
    args: impl rusqlite::Params,
) -> StoreResult<Vec<ScheduledTaskDefinition>> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_definitions {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, schedule_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(ScheduleRow::into_definition).collect()
}

fn record_outcome(
    conn: &Connection,
    name: &str,
    success: bool,
    status: &str,
) -> StoreResult<ScheduleOutcome> {
    let affected = if success {
        conn.execute(
            "UPDATE scheduled_definitions SET consecutive_failures = 0, last_run_status = ?2
             WHERE name = ?1",
            params![name, status],
        )?
    } else {
        conn.execute(
            "UPDATE scheduled_definitions
             SET consecutive_failures = consecutive_failures + 1, last_run_status = ?2
             WHERE name = ?1",
            params![name, status],
        )?
    };
    if affected == 0 {
        return Err(OverseerError::NotFound(format!("schedule '{name}'")).into());
    }
    let disabled_now = !success
        && conn.execute(
            "UPDATE scheduled_definitions SET enabled = 0
             WHERE name = ?1 AND enabled = 1 AND consecutive_failures >= max_consecutive_failures",
            [name],
        )? == 1;
    Ok(ScheduleOutcome {
        definition: load_existing(conn, name)?,
        disabled_now,
    })
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn insert_schedule(&self, definition: &ScheduledTaskDefinition) -> OverseerResult<bool> {
        let recurrence = serde_json::to_string(&definition.recurrence)?;
        let payload = serde_json::to_string(&definition.payload)?;
        self.with_conn(|conn| {
            let affected = conn.execute(
                "INSERT OR IGNORE INTO scheduled_definitions (name, task_type, title, payload,
                     priority_rank, recurrence, next_run_at, last_run_at, last_run_status,
                     last_task_id, consecutive_failures, max_consecutive_failures, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, 0, ?8, ?9)",
                params![
                    definition.name,
                    definition.task_type,
                    definition.title,
                    payload,
                    definition.priority.rank(),
                    recurrence,
                    to_millis(definition.next_run_at),
                    definition.max_consecutive_failures,
                    definition.enabled,
                ],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn get_schedule(&self, name: &str) -> OverseerResult<Option<ScheduledTaskDefinition>> {
        self.with_conn(|conn| load(conn, name)).await
    }

    async fn list_schedules(&self) -> OverseerResult<Vec<ScheduledTaskDefinition>> {
        self.with_conn(|conn| query(conn, "ORDER BY name", [])).await
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> OverseerResult<Vec<ScheduledTaskDefinition>> {
        self.with_conn(|conn| {
            query(
                conn,
                "WHERE enabled = 1 AND next_run_at <= ?1 ORDER BY next_run_at",
                [to_millis(now)],
            )
        })
        .await
    }

    async fn advance_schedule(
        &self,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
        generated: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE scheduled_definitions
                 SET next_run_at = ?3, last_run_at = ?4,
                     last_task_id = COALESCE(?5, last_task_id)
                 WHERE name = ?1 AND next_run_at = ?2",
                params![
                    name,
                    to_millis(expected),
                    to_millis(next),
                    to_millis(now),
                    generated.map(|id| id.to_string()),
                ],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn set_schedule_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> OverseerResult<ScheduledTaskDefinition> {
        let definition = self
            .with_tx(|tx| {
                // re-enabling starts a fresh failure streak
                let affected = tx.execute(
                    "UPDATE scheduled_definitions
                     SET enabled = ?2,
                         consecutive_failures = CASE WHEN ?2 THEN 0 ELSE consecutive_failures END
                     WHERE name = ?1",
                    params![name, enabled],
                )?;
                if affected == 0 {
                    return Err(OverseerError::NotFound(format!("schedule '{name}'")).into());
                }
                load_existing(tx, name)
            })
            .await?;
        tracing::info!(schedule = %name, enabled, "schedule toggled");
        Ok(definition)
    }

    async fn record_schedule_outcome(
        &self,
        name: &str,
        success: bool,
        status: &str,
    ) -> OverseerResult<ScheduleOutcome> {
        self.with_tx(|tx| record_outcome(tx, name, success, status))
            .await
    }
}
