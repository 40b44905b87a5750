use super::rows::{from_millis, parse_enum, parse_uuid, to_millis};
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::WorkerRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{OverseerError, OverseerResult, WorkerRecord, WorkerStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const WORKER_COLUMNS: &str =
    "worker_id, capabilities, status, current_task, last_heartbeat, registered_at";

type WorkerRow = (String, String, String, Option<String>, i64, i64);

fn worker_row(row: &Row<'_>) -> rusqlite::Result<WorkerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(
    (worker_id, caps, status, current, heartbeat, registered): WorkerRow,
) -> StoreResult<WorkerRecord> {
    Ok(WorkerRecord {
        worker_id,
        capabilities: serde_json::from_str(&caps)?,
        status: parse_enum::<WorkerStatus>(&status)?,
        current_task: current.as_deref().map(parse_uuid).transpose()?,
        last_heartbeat: from_millis(heartbeat)?,
        registered_at: from_millis(registered)?,
    })
}

fn load(conn: &Connection, worker_id: &str) -> StoreResult<Option<WorkerRecord>> {
    let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1");
    conn.query_row(&sql, [worker_id], worker_row)
        .optional()?
        .map(decode)
        .transpose()
}

fn load_existing(conn: &Connection, worker_id: &str) -> StoreResult<WorkerRecord> {
    load(conn, worker_id)?
        .ok_or_else(|| OverseerError::NotFound(format!("worker {worker_id}")).into())
}

fn query(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> StoreResult<Vec<WorkerRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, worker_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode).collect()
}

#[async_trait]
impl WorkerRegistry for SqliteStore {
    async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        if worker_id.trim().is_empty() {
            return Err(OverseerError::Validation("worker id must not be empty".into()));
        }
        let caps = serde_json::to_string(capabilities)?;
        let record = self
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO workers (worker_id, capabilities, status, current_task,
                         last_heartbeat, registered_at)
                     VALUES (?1, ?2, 'active', NULL, ?3, ?3)
                     ON CONFLICT(worker_id) DO UPDATE SET
                         capabilities = excluded.capabilities,
                         status = 'active',
                         last_heartbeat = excluded.last_heartbeat",
                    params![worker_id, caps, to_millis(now)],
                )?;
                load_existing(tx, worker_id)
            })
            .await?;
        tracing::info!(
            worker_id = %worker_id,
            capabilities = ?record.capabilities,
            "worker registered"
        );
        Ok(record)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        current_task: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        let status = if current_task.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Active
        };
        let previous = self
            .with_tx(|tx| {
                let previous = load(tx, worker_id)?.map(|w| w.status);
                tx.execute(
                    "INSERT INTO workers (worker_id, capabilities, status, current_task,
                         last_heartbeat, registered_at)
                     VALUES (?1, '[]', ?2, ?3, ?4, ?4)
                     ON CONFLICT(worker_id) DO UPDATE SET
                         status = excluded.status,
                         current_task = excluded.current_task,
                         last_heartbeat = excluded.last_heartbeat",
                    params![
                        worker_id,
                        status.as_str(),
                        current_task.map(|id| id.to_string()),
                        to_millis(now)
                    ],
                )?;
                Ok((previous, load_existing(tx, worker_id)?))
            })
            .await?;
        let (previous, record) = previous;
        if previous == Some(WorkerStatus::Offline) {
            tracing::info!(worker_id = %worker_id, "offline worker is back");
        }
        Ok(record)
    }

    async fn get_worker(&self, worker_id: &str) -> OverseerResult<Option<WorkerRecord>> {
        self.with_conn(|conn| load(conn, worker_id)).await
    }

    async fn list_workers(&self) -> OverseerResult<Vec<WorkerRecord>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY worker_id");
        self.with_conn(|conn| query(conn, &sql, [])).await
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> OverseerResult<Vec<WorkerRecord>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers
             WHERE status <> 'offline' AND last_heartbeat < ?1
             ORDER BY last_heartbeat"
        );
        self.with_conn(|conn| query(conn, &sql, [to_millis(cutoff)]))
            .await
    }

    async fn mark_offline(&self, worker_id: &str, cutoff: DateTime<Utc>) -> OverseerResult<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE workers SET status = 'offline', current_task = NULL
                 WHERE worker_id = ?1 AND status <> 'offline' AND last_heartbeat < ?2",
                params![worker_id, to_millis(cutoff)],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn set_worker_offline(&self, worker_id: &str) -> OverseerResult<()> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE workers SET status = 'offline', current_task = NULL WHERE worker_id = ?1",
                [worker_id],
            )?;
            if affected == 0 {
                return Err(OverseerError::NotFound(format!("worker {worker_id}")).into());
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_register_is_idempotent_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let first = store.register("w1", &["email".to_string()], t0).await.unwrap();
        let again = store
            .register("w1", &["email".to_string(), "report".to_string()], t0 + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(again.capabilities.len(), 2);
        assert_eq!(again.registered_at, first.registered_at);
        assert_eq!(store.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_sets_busy_and_creates_unknown() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = Uuid::new_v4();
        let rec = store.heartbeat("ghost", Some(task), Utc::now()).await.unwrap();
        assert_eq!(rec.status, WorkerStatus::Busy);
        assert_eq!(rec.current_task, Some(task));
        assert!(rec.capabilities.is_empty());

        let rec = store.heartbeat("ghost", None, Utc::now()).await.unwrap();
        assert_eq!(rec.status, WorkerStatus::Active);
    }

    #[tokio::test]
    async fn test_stale_detection_and_conditional_offline() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        store.register("old", &[], t0 - Duration::seconds(300)).await.unwrap();
        store.register("fresh", &[], t0).await.unwrap();

        let cutoff = t0 - Duration::seconds(90);
        let stale = store.stale_workers(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id, "old");

        assert!(store.mark_offline("old", cutoff).await.unwrap());
        assert!(!store.mark_offline("old", cutoff).await.unwrap());
        assert!(!store.mark_offline("fresh", cutoff).await.unwrap());
        assert!(store.stale_workers(cutoff).await.unwrap().is_empty());

        let back = store.heartbeat("old", None, t0).await.unwrap();
        assert_eq!(back.status, WorkerStatus::Active);
    }
}
