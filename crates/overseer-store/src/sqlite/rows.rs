//! Column encoding shared by the table modules.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use overseer_core::{
    BlockReason, HistoryEntry, HistoryEvent, Priority, RiskLevel, Task, TaskStatus,
};
use rusqlite::{Connection, OptionalExtension, Row};
use std::str::FromStr;
use uuid::Uuid;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

pub(crate) fn opt_from_millis(millis: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

pub(crate) fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad uuid '{raw}': {e}")))
}

pub(crate) fn parse_enum<T>(raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = overseer_core::OverseerError>,
{
    raw.parse::<T>().map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn priority_from_rank(rank: i64) -> StoreResult<Priority> {
    Priority::from_rank(rank).ok_or_else(|| StoreError::Corrupt(format!("priority rank {rank}")))
}

/// Task columns in the order [`task_from_row`] reads them. The trailing
/// column is the comma-joined dependency list.
pub(crate) const TASK_COLUMNS: &str = "t.id, t.task_type, t.title, t.description, t.payload, \
     t.priority_rank, t.status, t.assigned_worker, t.attempt_count, t.max_attempts, \
     t.estimated_cost, t.actual_cost, t.requires_approval, t.risk_level, \
     t.completion_evidence, t.error_message, t.block_reason, t.available_at, \
     t.avoid_worker, t.avoid_until, t.last_worker, t.schedule_name, t.dedupe_key, \
     t.created_at, t.updated_at, t.started_at, t.completed_at, \
     (SELECT group_concat(d.depends_on) FROM task_dependencies d WHERE d.task_id = t.id)";

/// Raw task row, decoded in two steps so rusqlite's row closure stays
/// infallible with respect to our own parsing.
pub(crate) struct TaskRow {
    id: String,
    task_type: String,
    title: String,
    description: String,
    payload: String,
    priority_rank: i64,
    status: String,
    assigned_worker: Option<String>,
    attempt_count: u32,
    max_attempts: u32,
    estimated_cost: f64,
    actual_cost: Option<f64>,
    requires_approval: bool,
    risk_level: String,
    completion_evidence: Option<String>,
    error_message: Option<String>,
    block_reason: Option<String>,
    available_at: i64,
    avoid_worker: Option<String>,
    avoid_until: Option<i64>,
    last_worker: Option<String>,
    schedule_name: Option<String>,
    dedupe_key: Option<String>,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    depends_on: Option<String>,
}

pub(crate) fn task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        payload: row.get(4)?,
        priority_rank: row.get(5)?,
        status: row.get(6)?,
        assigned_worker: row.get(7)?,
        attempt_count: row.get(8)?,
        max_attempts: row.get(9)?,
        estimated_cost: row.get(10)?,
        actual_cost: row.get(11)?,
        requires_approval: row.get(12)?,
        risk_level: row.get(13)?,
        completion_evidence: row.get(14)?,
        error_message: row.get(15)?,
        block_reason: row.get(16)?,
        available_at: row.get(17)?,
        avoid_worker: row.get(18)?,
        avoid_until: row.get(19)?,
        last_worker: row.get(20)?,
        schedule_name: row.get(21)?,
        dedupe_key: row.get(22)?,
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
        started_at: row.get(25)?,
        completed_at: row.get(26)?,
        depends_on: row.get(27)?,
    })
}

impl TaskRow {
    pub(crate) fn into_task(self) -> StoreResult<Task> {
        let depends_on = match self.depends_on.as_deref() {
            Some(list) if !list.is_empty() => list
                .split(',')
                .map(parse_uuid)
                .collect::<StoreResult<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Task {
            id: parse_uuid(&self.id)?,
            task_type: self.task_type,
            title: self.title,
            description: self.description,
            payload: serde_json::from_str(&self.payload)?,
            priority: priority_from_rank(self.priority_rank)?,
            status: parse_enum::<TaskStatus>(&self.status)?,
            assigned_worker: self.assigned_worker,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            depends_on,
            estimated_cost: self.estimated_cost,
            actual_cost: self.actual_cost,
            requires_approval: self.requires_approval,
            risk_level: parse_enum::<RiskLevel>(&self.risk_level)?,
            completion_evidence: self
                .completion_evidence
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_message: self.error_message,
            block_reason: self
                .block_reason
                .as_deref()
                .map(parse_enum::<BlockReason>)
                .transpose()?,
            available_at: from_millis(self.available_at)?,
            avoid_worker: self.avoid_worker,
            avoid_until: opt_from_millis(self.avoid_until)?,
            last_worker: self.last_worker,
            schedule_name: self.schedule_name,
            dedupe_key: self.dedupe_key,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            started_at: opt_from_millis(self.started_at)?,
            completed_at: opt_from_millis(self.completed_at)?,
        })
    }
}

pub(crate) fn load_task(conn: &Connection, id: Uuid) -> StoreResult<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1");
    conn.query_row(&sql, [id.to_string()], task_row)
        .optional()?
        .map(TaskRow::into_task)
        .transpose()
}

pub(crate) fn current_status(conn: &Connection, id: Uuid) -> StoreResult<Option<TaskStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_enum::<TaskStatus>).transpose()
}

/// One row in the lifecycle history log.
pub(crate) struct HistoryRecord<'a> {
    pub task_id: Uuid,
    pub event: HistoryEvent,
    pub from: Option<TaskStatus>,
    pub to: Option<TaskStatus>,
    pub worker_id: Option<&'a str>,
    pub reason: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
    pub at: DateTime<Utc>,
}

pub(crate) fn append_history(conn: &Connection, record: &HistoryRecord<'_>) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO task_history
             (task_id, event, from_status, to_status, worker_id, reason, fingerprint, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            record.task_id.to_string(),
            record.event.as_str(),
            record.from.map(TaskStatus::as_str),
            record.to.map(TaskStatus::as_str),
            record.worker_id,
            record.reason,
            record.fingerprint,
            to_millis(record.at),
        ],
    )?;
    Ok(())
}

pub(crate) fn history_for(conn: &Connection, task_id: Uuid) -> StoreResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, event, from_status, to_status, worker_id, reason, fingerprint, at
         FROM task_history WHERE task_id = ?1 ORDER BY id",
    )?;
    let raw = stmt
        .query_map([task_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter()
        .map(|(id, event, from, to, worker_id, reason, fingerprint, at)| {
            Ok(HistoryEntry {
                id,
                task_id,
                event: parse_enum::<HistoryEvent>(&event)?,
                from_status: from.as_deref().map(parse_enum::<TaskStatus>).transpose()?,
                to_status: to.as_deref().map(parse_enum::<TaskStatus>).transpose()?,
                worker_id,
                reason,
                fingerprint,
                at: from_millis(at)?,
            })
        })
        .collect()
}
