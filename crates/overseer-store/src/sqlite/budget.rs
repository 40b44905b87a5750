use super::rows::{from_millis, opt_from_millis, parse_enum, parse_uuid, to_millis};
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::BudgetLedger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{
    AllocationStatus, BudgetLimits, BudgetPeriod, BudgetScope, BudgetUsage, OverseerResult,
    ResourceAllocation,
};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn load_limits(conn: &Connection, scope: &BudgetScope) -> StoreResult<BudgetLimits> {
    let limits = conn
        .query_row(
            "SELECT daily, weekly, monthly FROM budget_limits WHERE scope = ?1",
            [scope.key()],
            |row| {
                Ok(BudgetLimits {
                    daily: row.get(0)?,
                    weekly: row.get(1)?,
                    monthly: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(limits.unwrap_or_default())
}

fn store_limits(conn: &Connection, scope: &BudgetScope, limits: &BudgetLimits) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO budget_limits (scope, daily, weekly, monthly) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(scope) DO UPDATE SET
             daily = excluded.daily, weekly = excluded.weekly, monthly = excluded.monthly",
        params![scope.key(), limits.daily, limits.weekly, limits.monthly],
    )?;
    Ok(())
}

/// Allocated and completed spend since `since`, optionally for one worker.
fn spent_since(conn: &Connection, scope: &BudgetScope, since: DateTime<Utc>) -> StoreResult<f64> {
    let worker = match scope {
        BudgetScope::Global => None,
        BudgetScope::Worker(id) => Some(id.as_str()),
    };
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(COALESCE(actual_cost, estimated_cost)), 0.0)
         FROM resource_allocations
         WHERE status IN ('allocated', 'completed') AND created_at >= ?1
           AND (?2 IS NULL OR worker_id = ?2)",
        params![to_millis(since), worker],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn close_allocation(
    conn: &Connection,
    task_id: Uuid,
    status: AllocationStatus,
    actual_cost: Option<f64>,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let affected = conn.execute(
        "UPDATE resource_allocations
         SET status = ?2, actual_cost = COALESCE(?3, actual_cost), finalized_at = ?4
         WHERE task_id = ?1 AND status = 'allocated'",
        params![task_id.to_string(), status.as_str(), actual_cost, to_millis(now)],
    )?;
    Ok(affected > 0)
}

#[async_trait]
impl BudgetLedger for SqliteStore {
    async fn get_limits(&self, scope: &BudgetScope) -> OverseerResult<BudgetLimits> {
        self.with_conn(|conn| load_limits(conn, scope)).await
    }

    async fn list_limits(&self) -> OverseerResult<Vec<(BudgetScope, BudgetLimits)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT scope, daily, weekly, monthly FROM budget_limits ORDER BY scope",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        BudgetLimits {
                            daily: row.get(1)?,
                            weekly: row.get(2)?,
                            monthly: row.get(3)?,
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(scope, limits)| Ok((parse_enum::<BudgetScope>(&scope)?, limits)))
                .collect()
        })
        .await
    }

    async fn set_limit(
        &self,
        scope: &BudgetScope,
        period: BudgetPeriod,
        limit: Option<f64>,
    ) -> OverseerResult<BudgetLimits> {
        let limits = self
            .with_tx(|tx| {
                let mut limits = load_limits(tx, scope)?;
                limits.set(period, limit);
                limits.validate()?;
                store_limits(tx, scope, &limits)?;
                Ok(limits)
            })
            .await?;
        tracing::info!(scope = %scope, period = %period, limit = ?limit, "budget limit updated");
        Ok(limits)
    }

    async fn seed_limits(
        &self,
        scope: &BudgetScope,
        limits: &BudgetLimits,
    ) -> OverseerResult<bool> {
        limits.validate()?;
        self.with_conn(|conn| {
            let affected = conn.execute(
                "INSERT OR IGNORE INTO budget_limits (scope, daily, weekly, monthly)
                 VALUES (?1, ?2, ?3, ?4)",
                params![scope.key(), limits.daily, limits.weekly, limits.monthly],
            )?;
            Ok(affected == 1)
        })
        .await
    }

    async fn usage(&self, scope: &BudgetScope, now: DateTime<Utc>) -> OverseerResult<BudgetUsage> {
        self.with_conn(|conn| {
            let mut usage = BudgetUsage::default();
            for period in BudgetPeriod::ALL {
                usage.set(period, spent_since(conn, scope, period.start_of(now))?);
            }
            Ok(usage)
        })
        .await
    }

    async fn allocate(&self, allocation: &ResourceAllocation) -> OverseerResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO resource_allocations (id, task_id, worker_id, estimated_cost,
                     actual_cost, status, created_at, finalized_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    allocation.id.to_string(),
                    allocation.task_id.to_string(),
                    allocation.worker_id,
                    allocation.estimated_cost,
                    allocation.actual_cost,
                    allocation.status.as_str(),
                    to_millis(allocation.created_at),
                    allocation.finalized_at.map(to_millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn finalize_allocation(
        &self,
        task_id: Uuid,
        actual_cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool> {
        self.with_conn(|conn| {
            close_allocation(conn, task_id, AllocationStatus::Completed, actual_cost, now)
        })
        .await
    }

    async fn release_allocation(&self, task_id: Uuid, now: DateTime<Utc>) -> OverseerResult<bool> {
        self.with_conn(|conn| {
            close_allocation(conn, task_id, AllocationStatus::Released, None, now)
        })
        .await
    }

    async fn allocations_for_task(
        &self,
        task_id: Uuid,
    ) -> OverseerResult<Vec<ResourceAllocation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, worker_id, estimated_cost, actual_cost, status, created_at,
                     finalized_at
                 FROM resource_allocations WHERE task_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([task_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(id, task, worker_id, estimated, actual, status, created, finalized)| {
                    Ok(ResourceAllocation {
                        id: parse_uuid(&id)?,
                        task_id: parse_uuid(&task)?,
                        worker_id,
                        estimated_cost: estimated,
                        actual_cost: actual,
                        status: parse_enum::<AllocationStatus>(&status)?,
                        created_at: from_millis(created)?,
                        finalized_at: opt_from_millis(finalized)?,
                    })
                })
                .collect()
        })
        .await
    }
}
