use super::rows::{from_millis, opt_from_millis, parse_enum, parse_uuid, to_millis};
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::EscalationStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{Escalation, EscalationStatus, OverseerError, OverseerResult, Severity};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const ESCALATION_COLUMNS: &str =
    "id, dedupe_key, task_id, severity, source, reason, status, created_at, acknowledged_at";

type EscalationRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<i64>,
);

fn escalation_row(row: &Row<'_>) -> rusqlite::Result<EscalationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode(row: EscalationRow) -> StoreResult<Escalation> {
    let (id, dedupe_key, task_id, severity, source, reason, status, created_at, acked) = row;
    Ok(Escalation {
        id: parse_uuid(&id)?,
        dedupe_key,
        task_id: task_id.as_deref().map(parse_uuid).transpose()?,
        severity: parse_enum::<Severity>(&severity)?,
        source,
        reason,
        status: parse_enum::<EscalationStatus>(&status)?,
        created_at: from_millis(created_at)?,
        acknowledged_at: opt_from_millis(acked)?,
    })
}

fn load(conn: &Connection, id: Uuid) -> StoreResult<Option<Escalation>> {
    let sql = format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], escalation_row)
        .optional()?
        .map(decode)
        .transpose()
}

fn raise(
    conn: &Connection,
    escalation: &Escalation,
    cooldown: Duration,
) -> StoreResult<Option<Escalation>> {
    let window_start = escalation.created_at - cooldown;
    let recent: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM escalations WHERE dedupe_key = ?1 AND created_at > ?2)",
        params![escalation.dedupe_key, to_millis(window_start)],
        |row| row.get(0),
    )?;
    if recent {
        return Ok(None);
    }
    conn.execute(
        "INSERT INTO escalations (id, dedupe_key, task_id, severity, source, reason, status,
             created_at, acknowledged_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, NULL)",
        params![
            escalation.id.to_string(),
            escalation.dedupe_key,
            escalation.task_id.map(|id| id.to_string()),
            escalation.severity.as_str(),
            escalation.source,
            escalation.reason,
            to_millis(escalation.created_at),
        ],
    )?;
    load(conn, escalation.id)
}

#[async_trait]
impl EscalationStore for SqliteStore {
    async fn raise_escalation(
        &self,
        escalation: &Escalation,
        cooldown: Duration,
    ) -> OverseerResult<Option<Escalation>> {
        let stored = self.with_tx(|tx| raise(tx, escalation, cooldown)).await?;
        match &stored {
            Some(esc) => tracing::warn!(
                escalation_id = %esc.id,
                key = %esc.dedupe_key,
                severity = %esc.severity,
                source = esc.source.as_deref().unwrap_or("-"),
                reason = %esc.reason,
                "escalation raised"
            ),
            None => {
                tracing::debug!(key = %escalation.dedupe_key, "escalation suppressed by cooldown")
            }
        }
        Ok(stored)
    }

    async fn list_escalations(
        &self,
        status: Option<EscalationStatus>,
    ) -> OverseerResult<Vec<Escalation>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {ESCALATION_COLUMNS} FROM escalations
                 WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([status.map(EscalationStatus::as_str)], escalation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(decode).collect()
        })
        .await
    }

    async fn acknowledge_escalation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> OverseerResult<Escalation> {
        self.with_tx(|tx| {
            let affected = tx.execute(
                "UPDATE escalations SET status = 'acknowledged', acknowledged_at = ?2
                 WHERE id = ?1 AND status = 'open'",
                params![id.to_string(), to_millis(now)],
            )?;
            let existing =
                load(tx, id)?.ok_or_else(|| OverseerError::NotFound(format!("escalation {id}")))?;
            if affected == 0 {
                return Err(OverseerError::Conflict(format!(
                    "escalation {id} is already acknowledged"
                ))
                .into());
            }
            Ok(existing)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooldown_suppresses_repeats() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let cooldown = Duration::minutes(15);

        let first = Escalation::new("stuck:a", Severity::Critical, "stuck").at(t0);
        assert!(store.raise_escalation(&first, cooldown).await.unwrap().is_some());

        let repeat =
            Escalation::new("stuck:a", Severity::Critical, "stuck").at(t0 + Duration::minutes(5));
        assert!(store.raise_escalation(&repeat, cooldown).await.unwrap().is_none());

        let other =
            Escalation::new("stuck:b", Severity::Critical, "stuck").at(t0 + Duration::minutes(5));
        assert!(store.raise_escalation(&other, cooldown).await.unwrap().is_some());

        let after =
            Escalation::new("stuck:a", Severity::Critical, "stuck").at(t0 + Duration::minutes(16));
        assert!(store.raise_escalation(&after, cooldown).await.unwrap().is_some());

        assert_eq!(store.list_escalations(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_acknowledge_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let esc = Escalation::new("k", Severity::Warning, "look")
            .from_source("test")
            .for_task(Uuid::new_v4());
        store.raise_escalation(&esc, Duration::zero()).await.unwrap();

        let acked = store.acknowledge_escalation(esc.id, Utc::now()).await.unwrap();
        assert_eq!(acked.status, EscalationStatus::Acknowledged);
        assert_eq!(acked.source.as_deref(), Some("test"));
        assert!(matches!(
            store.acknowledge_escalation(esc.id, Utc::now()).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));
        assert!(matches!(
            store.acknowledge_escalation(Uuid::new_v4(), Utc::now()).await.unwrap_err(),
            OverseerError::NotFound(_)
        ));
        assert!(store
            .list_escalations(Some(EscalationStatus::Open))
            .await
            .unwrap()
            .is_empty());
    }
}
