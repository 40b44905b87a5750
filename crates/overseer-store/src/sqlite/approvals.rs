use super::rows::{from_millis, opt_from_millis, parse_enum, parse_uuid, to_millis};
use super::tasks::apply_transition;
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::{ApprovalStore, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{
    ApprovalDecision, ApprovalRequest, HistoryEvent, OverseerError, OverseerResult, RiskLevel,
    Task, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const APPROVAL_COLUMNS: &str = "id, task_id, risk_level, decision, applied_default, reason, \
     reviewer, created_at, expires_at, decided_at";

struct ApprovalRow {
    id: String,
    task_id: String,
    risk_level: String,
    decision: String,
    applied_default: Option<String>,
    reason: Option<String>,
    reviewer: Option<String>,
    created_at: i64,
    expires_at: i64,
    decided_at: Option<i64>,
}

fn approval_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRow> {
    Ok(ApprovalRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        risk_level: row.get(2)?,
        decision: row.get(3)?,
        applied_default: row.get(4)?,
        reason: row.get(5)?,
        reviewer: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        decided_at: row.get(9)?,
    })
}

impl ApprovalRow {
    fn into_request(self) -> StoreResult<ApprovalRequest> {
        Ok(ApprovalRequest {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            risk_level: parse_enum::<RiskLevel>(&self.risk_level)?,
            decision: parse_enum::<ApprovalDecision>(&self.decision)?,
            applied_default: self
                .applied_default
                .as_deref()
                .map(parse_enum::<ApprovalDecision>)
                .transpose()?,
            reason: self.reason,
            reviewer: self.reviewer,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            decided_at: opt_from_millis(self.decided_at)?,
        })
    }
}

fn query(
    conn: &Connection,
    clause: &str,
    args: impl rusqlite::Params,
) -> StoreResult<Vec<ApprovalRequest>> {
    let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, approval_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(ApprovalRow::into_request).collect()
}

fn load(conn: &Connection, id: Uuid) -> StoreResult<Option<ApprovalRequest>> {
    let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], approval_row)
        .optional()?
        .map(ApprovalRow::into_request)
        .transpose()
}

fn open(
    conn: &Connection,
    request: &ApprovalRequest,
    worker_id: &str,
) -> StoreResult<ApprovalRequest> {
    if request.decision != ApprovalDecision::Pending {
        return Err(
            OverseerError::Validation("new approval requests must be pending".into()).into(),
        );
    }
    apply_transition(
        conn,
        &Transition::new(
            request.task_id,
            TaskStatus::InProgress,
            TaskStatus::WaitingApproval,
            HistoryEvent::ApprovalRequested,
        )
        .held_by(worker_id)
        .reason(format!("risk {}", request.risk_level))
        .at(request.created_at),
    )?;
    conn.execute(
        "INSERT INTO approvals (id, task_id, risk_level, decision, applied_default, reason,
             reviewer, created_at, expires_at, decided_at)
         VALUES (?1, ?2, ?3, 'pending', NULL, NULL, NULL, ?4, ?5, NULL)",
        params![
            request.id.to_string(),
            request.task_id.to_string(),
            request.risk_level.as_str(),
            to_millis(request.created_at),
            to_millis(request.expires_at),
        ],
    )?;
    load(conn, request.id)?
        .ok_or_else(|| OverseerError::NotFound(format!("approval {}", request.id)).into())
}

fn decide(
    conn: &Connection,
    id: Uuid,
    decision: ApprovalDecision,
    applied_default: Option<ApprovalDecision>,
    reviewer: Option<&str>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<(ApprovalRequest, Task)> {
    let effective = match (decision, applied_default) {
        (ApprovalDecision::Approved, None) => ApprovalDecision::Approved,
        (ApprovalDecision::Rejected, None) => ApprovalDecision::Rejected,
        (
            ApprovalDecision::Expired,
            Some(d @ (ApprovalDecision::Approved | ApprovalDecision::Rejected)),
        ) => d,
        _ => {
            return Err(OverseerError::Validation(format!(
                "cannot decide approval {id} as {} with default {:?}",
                decision.as_str(),
                applied_default.map(ApprovalDecision::as_str)
            ))
            .into())
        }
    };

    let affected = conn.execute(
        "UPDATE approvals SET decision = ?2, applied_default = ?3, reviewer = ?4, reason = ?5,
             decided_at = ?6
         WHERE id = ?1 AND decision = 'pending'",
        params![
            id.to_string(),
            decision.as_str(),
            applied_default.map(ApprovalDecision::as_str),
            reviewer,
            reason,
            to_millis(now),
        ],
    )?;
    if affected == 0 {
        let existing = load(conn, id)?
            .ok_or_else(|| OverseerError::NotFound(format!("approval {id}")))?;
        return Err(OverseerError::Conflict(format!(
            "approval {id} was already decided ({})",
            existing.decision.as_str()
        ))
        .into());
    }
    let request = load(conn, id)?.ok_or_else(|| OverseerError::NotFound(format!("approval {id}")))?;

    let note = reason.map(str::to_string).unwrap_or_else(|| match decision {
        ApprovalDecision::Expired => format!("approval expired; default {}", effective.as_str()),
        _ => format!("approval {}", effective.as_str()),
    });
    let mut transition = if effective == ApprovalDecision::Approved {
        Transition::new(
            request.task_id,
            TaskStatus::WaitingApproval,
            TaskStatus::Pending,
            HistoryEvent::Approved,
        )
        .available_at(now)
    } else {
        Transition::new(
            request.task_id,
            TaskStatus::WaitingApproval,
            TaskStatus::Rejected,
            HistoryEvent::Rejected,
        )
        .error(note.clone())
    };
    transition = transition.reason(note).at(now);
    if let Some(reviewer) = reviewer {
        transition = transition.by(reviewer);
    }
    let task = apply_transition(conn, &transition)?;
    Ok((request, task))
}

#[async_trait]
impl ApprovalStore for SqliteStore {
    async fn open_approval(
        &self,
        request: &ApprovalRequest,
        worker_id: &str,
    ) -> OverseerResult<ApprovalRequest> {
        let stored = self.with_tx(|tx| open(tx, request, worker_id)).await?;
        tracing::info!(
            task_id = %stored.task_id,
            approval_id = %stored.id,
            risk = %stored.risk_level,
            expires_at = %stored.expires_at,
            "approval requested"
        );
        Ok(stored)
    }

    async fn get_approval(&self, id: Uuid) -> OverseerResult<Option<ApprovalRequest>> {
        self.with_conn(|conn| load(conn, id)).await
    }

    async fn latest_approval(&self, task_id: Uuid) -> OverseerResult<Option<ApprovalRequest>> {
        self.with_conn(|conn| {
            let mut found = query(
                conn,
                "WHERE task_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [task_id.to_string()],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn list_approvals(
        &self,
        decision: Option<ApprovalDecision>,
    ) -> OverseerResult<Vec<ApprovalRequest>> {
        self.with_conn(|conn| {
            query(
                conn,
                "WHERE (?1 IS NULL OR decision = ?1) ORDER BY created_at",
                [decision.map(ApprovalDecision::as_str)],
            )
        })
        .await
    }

    async fn expired_approvals(&self, now: DateTime<Utc>) -> OverseerResult<Vec<ApprovalRequest>> {
        self.with_conn(|conn| {
            query(
                conn,
                "WHERE decision = 'pending' AND expires_at <= ?1 ORDER BY expires_at",
                [to_millis(now)],
            )
        })
        .await
    }

    async fn decide_approval(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        applied_default: Option<ApprovalDecision>,
        reviewer: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> OverseerResult<(ApprovalRequest, Task)> {
        let (request, task) = self
            .with_tx(|tx| decide(tx, id, decision, applied_default, reviewer, reason, now))
            .await?;
        tracing::info!(
            approval_id = %id,
            task_id = %task.id,
            decision = request.decision.as_str(),
            task_status = %task.status,
            "approval decided"
        );
        Ok((request, task))
    }
}
