use super::rows::{from_millis, parse_enum, parse_uuid, to_millis};
use super::tasks::apply_transition;
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::{DeadLetterStore, FailureRecord, RetryStep, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{
    DeadLetterEntry, DeadLetterStatus, HistoryEvent, OverseerError, OverseerResult, Task,
    TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const DLQ_COLUMNS: &str = "task_id, snapshot, failure_reason, fingerprint, failure_count, \
     retry_count, max_retries, status, resolution_note, first_failed_at, last_failure_at, \
     updated_at";

struct DlqRow {
    task_id: String,
    snapshot: String,
    failure_reason: String,
    fingerprint: String,
    failure_count: u32,
    retry_count: u32,
    max_retries: u32,
    status: String,
    resolution_note: Option<String>,
    first_failed_at: i64,
    last_failure_at: i64,
    updated_at: i64,
}

fn dlq_row(row: &Row<'_>) -> rusqlite::Result<DlqRow> {
    Ok(DlqRow {
        task_id: row.get(0)?,
        snapshot: row.get(1)?,
        failure_reason: row.get(2)?,
        fingerprint: row.get(3)?,
        failure_count: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        status: row.get(7)?,
        resolution_note: row.get(8)?,
        first_failed_at: row.get(9)?,
        last_failure_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl DlqRow {
    fn into_entry(self) -> StoreResult<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            task_id: parse_uuid(&self.task_id)?,
            snapshot: serde_json::from_str(&self.snapshot)?,
            failure_reason: self.failure_reason,
            fingerprint: self.fingerprint,
            failure_count: self.failure_count,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            status: parse_enum::<DeadLetterStatus>(&self.status)?,
            resolution_note: self.resolution_note,
            first_failed_at: from_millis(self.first_failed_at)?,
            last_failure_at: from_millis(self.last_failure_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn load(conn: &Connection, task_id: Uuid) -> StoreResult<Option<DeadLetterEntry>> {
    let sql = format!("SELECT {DLQ_COLUMNS} FROM dead_letters WHERE task_id = ?1");
    conn.query_row(&sql, [task_id.to_string()], dlq_row)
        .optional()?
        .map(DlqRow::into_entry)
        .transpose()
}

fn load_existing(conn: &Connection, task_id: Uuid) -> StoreResult<DeadLetterEntry> {
    load(conn, task_id)?.ok_or_else(|| {
        OverseerError::NotFound(format!("dead-letter entry for task {task_id}")).into()
    })
}

fn park(
    conn: &Connection,
    task_id: Uuid,
    reason: &str,
    fingerprint: &str,
    max_retries: u32,
    now: DateTime<Utc>,
) -> StoreResult<DeadLetterEntry> {
    let task = apply_transition(
        conn,
        &Transition::new(
            task_id,
            TaskStatus::Failed,
            TaskStatus::DeadLettered,
            HistoryEvent::DeadLettered,
        )
        .reason(reason)
        .fingerprint(fingerprint)
        .at(now),
    )?;
    let snapshot = serde_json::to_string(&task)?;
    conn.execute(
        "INSERT INTO dead_letters (task_id, snapshot, failure_reason, fingerprint, failure_count,
             retry_count, max_retries, status, resolution_note, first_failed_at, last_failure_at,
             updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, 'pending', NULL, ?6, ?6, ?6)
         ON CONFLICT(task_id) DO UPDATE SET
             snapshot = excluded.snapshot,
             failure_reason = excluded.failure_reason,
             fingerprint = excluded.fingerprint,
             failure_count = dead_letters.failure_count + 1,
             status = 'pending',
             last_failure_at = excluded.last_failure_at,
             updated_at = excluded.updated_at",
        params![
            task_id.to_string(),
            snapshot,
            reason,
            fingerprint,
            max_retries,
            to_millis(now)
        ],
    )?;
    load_existing(conn, task_id)
}

fn record_failure(
    conn: &Connection,
    failure: &Transition,
    retry: &RetryStep<'_>,
    max_retries: u32,
) -> StoreResult<FailureRecord> {
    if failure.to != TaskStatus::Failed {
        return Err(OverseerError::Validation(format!(
            "recording a failure of task {} must move it to failed, not {}",
            failure.task_id, failure.to
        ))
        .into());
    }
    let failed = apply_transition(conn, failure)?;
    if failed.has_attempts_left() {
        let task = apply_transition(conn, &retry(&failed))?;
        return Ok(FailureRecord::Retried(task));
    }

    let reason = failure
        .error_message
        .as_deref()
        .or(failure.reason.as_deref())
        .unwrap_or("retry budget exhausted");
    let fingerprint = failure.fingerprint.as_deref().unwrap_or_default();
    let entry = park(conn, failed.id, reason, fingerprint, max_retries, failure.at)?;
    Ok(FailureRecord::DeadLettered {
        task: entry.snapshot.clone(),
        entry,
    })
}

fn close(
    conn: &Connection,
    task_id: Uuid,
    status: DeadLetterStatus,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<DeadLetterEntry> {
    if !status.is_closed() {
        return Err(OverseerError::Validation(format!(
            "dead-letter entries can only be resolved or abandoned, not set to {}",
            status.as_str()
        ))
        .into());
    }
    let affected = conn.execute(
        "UPDATE dead_letters SET status = ?2, resolution_note = ?3, updated_at = ?4
         WHERE task_id = ?1 AND status IN ('pending', 'retrying')",
        params![task_id.to_string(), status.as_str(), note, to_millis(now)],
    )?;
    if affected == 0 {
        let entry = load_existing(conn, task_id)?;
        return Err(OverseerError::Conflict(format!(
            "dead-letter entry for task {task_id} is already {}",
            entry.status.as_str()
        ))
        .into());
    }
    load_existing(conn, task_id)
}

fn requeue(conn: &Connection, task_id: Uuid, now: DateTime<Utc>) -> StoreResult<Task> {
    let entry = load_existing(conn, task_id)?;
    if !entry.can_requeue() {
        return Err(OverseerError::Conflict(format!(
            "dead-letter entry for task {task_id} cannot be requeued (status {}, retries {}/{})",
            entry.status.as_str(),
            entry.retry_count,
            entry.max_retries
        ))
        .into());
    }
    let task = apply_transition(
        conn,
        &Transition::new(
            task_id,
            TaskStatus::DeadLettered,
            TaskStatus::Pending,
            HistoryEvent::Requeued,
        )
        .reason("operator requeue")
        .reset_attempts()
        .available_at(now)
        .at(now),
    )?;
    conn.execute(
        "UPDATE dead_letters SET status = 'retrying', retry_count = retry_count + 1, updated_at = ?2
         WHERE task_id = ?1",
        params![task_id.to_string(), to_millis(now)],
    )?;
    Ok(task)
}

#[async_trait]
impl DeadLetterStore for SqliteStore {
    async fn record_failure(
        &self,
        failure: &Transition,
        retry: &RetryStep<'_>,
        max_retries: u32,
    ) -> OverseerResult<FailureRecord> {
        let record = self
            .with_tx(|tx| record_failure(tx, failure, retry, max_retries))
            .await?;
        if let FailureRecord::DeadLettered { entry, .. } = &record {
            tracing::warn!(
                task_id = %entry.task_id,
                failure_count = entry.failure_count,
                fingerprint = %entry.fingerprint,
                "task dead-lettered"
            );
        }
        Ok(record)
    }

    async fn dead_letter(
        &self,
        task_id: Uuid,
        reason: &str,
        fingerprint: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry> {
        let entry = self
            .with_tx(|tx| park(tx, task_id, reason, fingerprint, max_retries, now))
            .await?;
        tracing::warn!(
            task_id = %task_id,
            failure_count = entry.failure_count,
            fingerprint = %entry.fingerprint,
            "task dead-lettered"
        );
        Ok(entry)
    }

    async fn get_dead_letter(&self, task_id: Uuid) -> OverseerResult<Option<DeadLetterEntry>> {
        self.with_conn(|conn| load(conn, task_id)).await
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> OverseerResult<Vec<DeadLetterEntry>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {DLQ_COLUMNS} FROM dead_letters
                 WHERE (?1 IS NULL OR status = ?1) ORDER BY last_failure_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([status.map(DeadLetterStatus::as_str)], dlq_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(DlqRow::into_entry).collect()
        })
        .await
    }

    async fn close_dead_letter(
        &self,
        task_id: Uuid,
        status: DeadLetterStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<DeadLetterEntry> {
        let entry = self.with_tx(|tx| close(tx, task_id, status, note, now)).await?;
        tracing::info!(
            task_id = %task_id,
            status = entry.status.as_str(),
            "dead-letter entry closed"
        );
        Ok(entry)
    }

    async fn requeue_dead_letter(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> OverseerResult<Task> {
        let task = self.with_tx(|tx| requeue(tx, task_id, now)).await?;
        tracing::info!(task_id = %task_id, "dead-lettered task requeued");
        Ok(task)
    }
}
