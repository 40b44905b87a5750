use super::rows::{
    self, append_history, current_status, load_task, to_millis, HistoryRecord, TaskRow,
    TASK_COLUMNS,
};
use super::SqliteStore;
use crate::error::StoreResult;
use crate::store::{InsertOutcome, TaskFilter, TaskStore, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::state_machine::{self, CLAIMABLE};
use overseer_core::{
    HistoryEntry, HistoryEvent, OverseerError, OverseerResult, Task, TaskStatus, ANY_CAPABILITY,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use uuid::Uuid;

/// Eligibility shared by candidate selection and the claim update. Binds
/// `:now` and `:worker`.
const CLAIMABLE_SQL: &str = "(t.status = 'pending'
        OR (t.status = 'failed' AND t.attempt_count < t.max_attempts))
    AND t.available_at <= :now
    AND NOT (t.avoid_worker IS NOT NULL AND t.avoid_worker = :worker AND t.avoid_until > :now)
    AND NOT EXISTS (
        SELECT 1 FROM task_dependencies d
        LEFT JOIN tasks dep ON dep.id = d.depends_on
        WHERE d.task_id = t.id AND (dep.id IS NULL OR dep.status <> 'completed')
    )";

pub(crate) fn insert(conn: &Connection, task: &Task) -> StoreResult<InsertOutcome> {
    task.validate_new()?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
        [task.id.to_string()],
        |row| row.get(0),
    )?;
    if exists {
        return Err(OverseerError::Conflict(format!("task {} already exists", task.id)).into());
    }
    for dep in &task.depends_on {
        if current_status(conn, *dep)?.is_none() {
            return Err(OverseerError::Validation(format!(
                "task {} depends on unknown task {dep}",
                task.id
            ))
            .into());
        }
    }

    let affected = conn.execute(
        "INSERT OR IGNORE INTO tasks (
             id, task_type, title, description, payload, priority_rank, status,
             assigned_worker, attempt_count, max_attempts, estimated_cost, actual_cost,
             requires_approval, risk_level, completion_evidence, error_message, block_reason,
             available_at, avoid_worker, avoid_until, last_worker, schedule_name, dedupe_key,
             created_at, updated_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0, ?8, ?9, NULL, ?10, ?11, NULL, NULL, NULL,
                 ?12, NULL, NULL, NULL, ?13, ?14, ?15, ?15, NULL, NULL)",
        params![
            task.id.to_string(),
            task.task_type,
            task.title,
            task.description,
            serde_json::to_string(&task.payload)?,
            task.priority.rank(),
            TaskStatus::Pending.as_str(),
            task.max_attempts,
            task.estimated_cost,
            task.requires_approval,
            task.risk_level.as_str(),
            to_millis(task.available_at),
            task.schedule_name,
            task.dedupe_key,
            to_millis(task.created_at),
        ],
    )?;
    if affected == 0 {
        return Ok(InsertOutcome::Duplicate);
    }

    for dep in &task.depends_on {
        conn.execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            params![task.id.to_string(), dep.to_string()],
        )?;
    }
    append_history(
        conn,
        &HistoryRecord {
            task_id: task.id,
            event: HistoryEvent::Submitted,
            from: None,
            to: Some(TaskStatus::Pending),
            worker_id: None,
            reason: None,
            fingerprint: None,
            at: task.created_at,
        },
    )?;
    Ok(InsertOutcome::Inserted)
}

pub(crate) fn list(conn: &Connection, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE 1 = 1");
    let mut args: Vec<Value> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND t.status = ?");
        args.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(priority) = filter.priority {
        sql.push_str(" AND t.priority_rank = ?");
        args.push(Value::Integer(priority.rank()));
    }
    if let Some(task_type) = &filter.task_type {
        sql.push_str(" AND t.task_type = ?");
        args.push(Value::Text(task_type.clone()));
    }
    if let Some(worker) = &filter.assigned_worker {
        sql.push_str(" AND t.assigned_worker = ?");
        args.push(Value::Text(worker.clone()));
    }
    if let Some(reason) = filter.block_reason {
        sql.push_str(" AND t.block_reason = ?");
        args.push(Value::Text(reason.as_str().to_string()));
    }
    if let Some(before) = filter.started_before {
        sql.push_str(" AND t.started_at IS NOT NULL AND t.started_at < ?");
        args.push(Value::Integer(to_millis(before)));
    }
    if let Some(name) = &filter.schedule_name {
        sql.push_str(" AND t.schedule_name = ?");
        args.push(Value::Text(name.clone()));
    }
    sql.push_str(" ORDER BY t.priority_rank, t.created_at");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), rows::task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

pub(crate) fn candidates(
    conn: &Connection,
    worker_id: &str,
    capabilities: &[String],
    limit: usize,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Uuid>> {
    if capabilities.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let wildcard = capabilities.iter().any(|c| c == ANY_CAPABILITY);

    let mut sql = format!("SELECT t.id FROM tasks t WHERE {CLAIMABLE_SQL}");
    let mut named: Vec<(String, Value)> = vec![
        (":now".into(), Value::Integer(to_millis(now))),
        (":worker".into(), Value::Text(worker_id.to_string())),
        (
            ":limit".into(),
            Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
        ),
    ];
    if !wildcard {
        let placeholders: Vec<String> =
            (0..capabilities.len()).map(|i| format!(":cap{i}")).collect();
        sql.push_str(&format!(" AND t.task_type IN ({})", placeholders.join(", ")));
        for (name, cap) in placeholders.into_iter().zip(capabilities) {
            named.push((name, Value::Text(cap.clone())));
        }
    }
    sql.push_str(" ORDER BY t.priority_rank, t.created_at LIMIT :limit");

    let bound: Vec<(&str, &dyn rusqlite::ToSql)> = named
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
        .collect();
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(bound.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.iter().map(String::as_str).map(rows::parse_uuid).collect()
}

pub(crate) fn try_claim(
    conn: &Connection,
    task_id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let Some(from) = current_status(conn, task_id)? else {
        return Ok(false);
    };
    if !CLAIMABLE.contains(&from) {
        return Ok(false);
    }
    state_machine::validate(task_id, from, TaskStatus::InProgress)?;

    let sql = format!(
        "UPDATE tasks SET status = 'in_progress', assigned_worker = :worker,
             last_worker = :worker, started_at = :now, updated_at = :now,
             block_reason = NULL
         WHERE id = :id AND status = :from AND id IN (
             SELECT t.id FROM tasks t WHERE t.id = :id AND {CLAIMABLE_SQL}
         )"
    );
    let affected = conn.execute(
        &sql,
        rusqlite::named_params! {
            ":worker": worker_id,
            ":now": to_millis(now),
            ":id": task_id.to_string(),
            ":from": from.as_str(),
        },
    )?;
    if affected != 1 {
        return Ok(false);
    }
    append_history(
        conn,
        &HistoryRecord {
            task_id,
            event: HistoryEvent::Claimed,
            from: Some(from),
            to: Some(TaskStatus::InProgress),
            worker_id: Some(worker_id),
            reason: None,
            fingerprint: None,
            at: now,
        },
    )?;
    Ok(true)
}

/// Whether the target status drops the current assignment.
fn clears_assignment(to: TaskStatus) -> bool {
    matches!(
        to,
        TaskStatus::Pending
            | TaskStatus::Blocked
            | TaskStatus::Failed
            | TaskStatus::DeadLettered
            | TaskStatus::Rejected
    )
}

pub(crate) fn apply_transition(conn: &Connection, t: &Transition) -> StoreResult<Task> {
    state_machine::validate(t.task_id, t.from, t.to)?;

    let at = to_millis(t.at);
    let mut sets: Vec<&str> = vec!["status = ?", "updated_at = ?"];
    let mut args: Vec<Value> = vec![
        Value::Text(t.to.as_str().to_string()),
        Value::Integer(at),
    ];

    if clears_assignment(t.to) {
        sets.push("assigned_worker = NULL");
    }
    if t.to == TaskStatus::InProgress {
        let worker = t.actor.clone().ok_or_else(|| {
            OverseerError::Validation(format!("resuming task {} needs a worker", t.task_id))
        })?;
        sets.push("assigned_worker = ?");
        args.push(Value::Text(worker.clone()));
        sets.push("last_worker = ?");
        args.push(Value::Text(worker));
        sets.push("started_at = ?");
        args.push(Value::Integer(at));
    }
    if t.to == TaskStatus::Blocked {
        let reason = t.block_reason.ok_or_else(|| {
            OverseerError::Validation(format!("blocking task {} needs a reason", t.task_id))
        })?;
        sets.push("block_reason = ?");
        args.push(Value::Text(reason.as_str().to_string()));
    } else {
        sets.push("block_reason = NULL");
    }
    if t.to == TaskStatus::Completed {
        sets.push("completed_at = ?");
        args.push(Value::Integer(at));
    }
    if let Some(message) = &t.error_message {
        sets.push("error_message = ?");
        args.push(Value::Text(message.clone()));
    }
    if let Some(evidence) = &t.completion_evidence {
        sets.push("completion_evidence = ?");
        args.push(Value::Text(serde_json::to_string(evidence)?));
    }
    if let Some(cost) = t.actual_cost {
        sets.push("actual_cost = ?");
        args.push(Value::Real(cost));
    }
    if t.reset_attempts {
        sets.push("attempt_count = 0");
    } else if t.increment_attempts {
        sets.push("attempt_count = attempt_count + 1");
    }
    if let Some(available) = t.available_at {
        sets.push("available_at = ?");
        args.push(Value::Integer(to_millis(available)));
    }
    if let Some((worker, until)) = &t.avoid {
        sets.push("avoid_worker = ?");
        args.push(Value::Text(worker.clone()));
        sets.push("avoid_until = ?");
        args.push(Value::Integer(to_millis(*until)));
    }

    let mut sql = format!(
        "UPDATE tasks SET {} WHERE id = ? AND status = ?",
        sets.join(", ")
    );
    args.push(Value::Text(t.task_id.to_string()));
    args.push(Value::Text(t.from.as_str().to_string()));
    if let Some(worker) = &t.expected_worker {
        sql.push_str(" AND assigned_worker = ?");
        args.push(Value::Text(worker.clone()));
    }

    let affected = conn.execute(&sql, params_from_iter(args))?;
    if affected != 1 {
        return Err(match current_status(conn, t.task_id)? {
            None => OverseerError::NotFound(format!("task {}", t.task_id)),
            Some(actual) if actual != t.from => OverseerError::Conflict(format!(
                "task {} is {actual}, expected {}",
                t.task_id, t.from
            )),
            Some(_) => OverseerError::Conflict(format!(
                "task {} is not held by {}",
                t.task_id,
                t.expected_worker.as_deref().unwrap_or("-")
            )),
        }
        .into());
    }

    append_history(
        conn,
        &HistoryRecord {
            task_id: t.task_id,
            event: t.event,
            from: Some(t.from),
            to: Some(t.to),
            worker_id: t.actor.as_deref(),
            reason: t.reason.as_deref().or(t.error_message.as_deref()),
            fingerprint: t.fingerprint.as_deref(),
            at: t.at,
        },
    )?;
    load_task(conn, t.task_id)?
        .ok_or_else(|| OverseerError::NotFound(format!("task {}", t.task_id)).into())
}

pub(crate) fn dependencies_met(conn: &Connection, task_id: Uuid) -> StoreResult<bool> {
    if current_status(conn, task_id)?.is_none() {
        return Err(OverseerError::NotFound(format!("task {task_id}")).into());
    }
    let unmet: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_dependencies d
         LEFT JOIN tasks dep ON dep.id = d.depends_on
         WHERE d.task_id = ?1 AND (dep.id IS NULL OR dep.status <> 'completed')",
        [task_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(unmet == 0)
}

pub(crate) fn status_counts(conn: &Connection) -> StoreResult<Vec<(TaskStatus, u64)>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
    let raw = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut counts: Vec<(TaskStatus, u64)> = TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
    for (status, count) in raw {
        let status = rows::parse_enum::<TaskStatus>(&status)?;
        if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
            slot.1 = count;
        }
    }
    Ok(counts)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> OverseerResult<InsertOutcome> {
        let outcome = self.with_tx(|tx| insert(tx, task)).await?;
        if outcome == InsertOutcome::Inserted {
            tracing::info!(
                task_id = %task.id,
                task_type = %task.task_type,
                priority = %task.priority,
                "task submitted"
            );
        }
        Ok(outcome)
    }

    async fn get_task(&self, id: Uuid) -> OverseerResult<Option<Task>> {
        self.with_conn(|conn| load_task(conn, id)).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> OverseerResult<Vec<Task>> {
        self.with_conn(|conn| list(conn, filter)).await
    }

    async fn claim_candidates(
        &self,
        worker_id: &str,
        capabilities: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> OverseerResult<Vec<Uuid>> {
        self.with_conn(|conn| candidates(conn, worker_id, capabilities, limit, now))
            .await
    }

    async fn try_claim(
        &self,
        task_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OverseerResult<bool> {
        self.with_tx(|tx| try_claim(tx, task_id, worker_id, now)).await
    }

    async fn transition(&self, transition: &Transition) -> OverseerResult<Task> {
        self.with_tx(|tx| apply_transition(tx, transition)).await
    }

    async fn dependencies_met(&self, task_id: Uuid) -> OverseerResult<bool> {
        self.with_conn(|conn| dependencies_met(conn, task_id)).await
    }

    async fn history(&self, task_id: Uuid) -> OverseerResult<Vec<HistoryEntry>> {
        self.with_conn(|conn| rows::history_for(conn, task_id)).await
    }

    async fn status_counts(&self) -> OverseerResult<Vec<(TaskStatus, u64)>> {
        self.with_conn(|conn| status_counts(conn)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use overseer_core::{BlockReason, Priority};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store();
        let task = Task::new("email", "hello").with_priority(Priority::High);
        assert_eq!(store.insert_task(&task).await.unwrap(), InsertOutcome::Inserted);

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.task_type, "email");
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.status, TaskStatus::Pending);

        let history = store.history(task.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, HistoryEvent::Submitted);
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts_and_dedupe_key_is_idempotent() {
        let store = store();
        let task = Task::new("email", "a").with_dedupe_key("k1");
        store.insert_task(&task).await.unwrap();
        let err = store.insert_task(&task).await.unwrap_err();
        assert!(matches!(err, OverseerError::Conflict(_)));

        let twin = Task::new("email", "b").with_dedupe_key("k1");
        assert_eq!(store.insert_task(&twin).await.unwrap(), InsertOutcome::Duplicate);
        assert!(store.get_task(twin.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let store = store();
        let task = Task::new("email", "a").with_dependencies(vec![Uuid::new_v4()]);
        let err = store.insert_task(&task).await.unwrap_err();
        assert!(matches!(err, OverseerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_priority_then_age() {
        let store = store();
        let now = Utc::now();
        let mut low = Task::new("email", "low").with_priority(Priority::Low);
        low.created_at = now - Duration::seconds(30);
        let mut old_normal = Task::new("email", "old").with_priority(Priority::Normal);
        old_normal.created_at = now - Duration::seconds(20);
        let mut new_normal = Task::new("email", "new").with_priority(Priority::Normal);
        new_normal.created_at = now - Duration::seconds(10);
        let critical = Task::new("email", "crit").with_priority(Priority::Critical);
        for t in [&low, &new_normal, &critical, &old_normal] {
            store.insert_task(t).await.unwrap();
        }

        let ids = store
            .claim_candidates("w1", &caps(&["email"]), 10, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(ids, vec![critical.id, old_normal.id, new_normal.id, low.id]);
    }

    #[tokio::test]
    async fn test_candidates_respect_capabilities() {
        let store = store();
        let email = Task::new("email", "e");
        let report = Task::new("report", "r");
        store.insert_task(&email).await.unwrap();
        store.insert_task(&report).await.unwrap();
        let later = Utc::now() + Duration::seconds(1);

        let ids = store.claim_candidates("w", &caps(&["report"]), 10, later).await.unwrap();
        assert_eq!(ids, vec![report.id]);
        let ids = store.claim_candidates("w", &caps(&["*"]), 10, later).await.unwrap();
        assert_eq!(ids.len(), 2);
        let ids = store.claim_candidates("w", &[], 10, later).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_unmet_dependency_excluded_until_completed() {
        let store = store();
        let parent = Task::new("email", "parent");
        store.insert_task(&parent).await.unwrap();
        let child = Task::new("email", "child").with_dependencies(vec![parent.id]);
        store.insert_task(&child).await.unwrap();
        let later = Utc::now() + Duration::seconds(1);

        let ids = store.claim_candidates("w", &caps(&["email"]), 10, later).await.unwrap();
        assert_eq!(ids, vec![parent.id]);
        assert!(!store.dependencies_met(child.id).await.unwrap());
        assert!(!store.try_claim(child.id, "w", later).await.unwrap());

        assert!(store.try_claim(parent.id, "w", later).await.unwrap());
        store
            .transition(
                &Transition::new(
                    parent.id,
                    TaskStatus::InProgress,
                    TaskStatus::Completed,
                    HistoryEvent::Completed,
                )
                .held_by("w")
                .at(later),
            )
            .await
            .unwrap();

        assert!(store.dependencies_met(child.id).await.unwrap());
        let ids = store.claim_candidates("w", &caps(&["email"]), 10, later).await.unwrap();
        assert_eq!(ids, vec![child.id]);
    }

    #[tokio::test]
    async fn test_claim_is_conditional() {
        let store = store();
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);

        assert!(store.try_claim(task.id, "a", now).await.unwrap());
        assert!(!store.try_claim(task.id, "b", now).await.unwrap());

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.assigned_worker.as_deref(), Some("a"));
        assert_eq!(loaded.last_worker.as_deref(), Some("a"));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_backoff_and_avoidance_hide_task() {
        let store = store();
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        assert!(store.try_claim(task.id, "a", now).await.unwrap());
        store
            .transition(
                &Transition::new(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    HistoryEvent::Failed,
                )
                .held_by("a")
                .error("boom")
                .count_attempt()
                .at(now),
            )
            .await
            .unwrap();
        store
            .transition(
                &Transition::new(
                    task.id,
                    TaskStatus::Failed,
                    TaskStatus::Pending,
                    HistoryEvent::RetryScheduled,
                )
                .available_at(now + Duration::seconds(10))
                .avoid("a", now + Duration::seconds(60))
                .at(now),
            )
            .await
            .unwrap();

        let email = caps(&["email"]);
        assert!(store.claim_candidates("b", &email, 5, now).await.unwrap().is_empty());
        let later = now + Duration::seconds(11);
        assert_eq!(store.claim_candidates("b", &email, 5, later).await.unwrap(), vec![task.id]);
        assert!(store.claim_candidates("a", &email, 5, later).await.unwrap().is_empty());
        let much_later = now + Duration::seconds(61);
        assert_eq!(
            store.claim_candidates("a", &email, 5, much_later).await.unwrap(),
            vec![task.id]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_writes_nothing() {
        let store = store();
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();

        let err = store
            .transition(&Transition::new(
                task.id,
                TaskStatus::Pending,
                TaskStatus::Completed,
                HistoryEvent::Completed,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OverseerError::InvalidTransition { .. }));
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(store.history(task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_guards_status_and_worker() {
        let store = store();
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store.try_claim(task.id, "a", now).await.unwrap();

        let wrong_worker = Transition::new(
            task.id,
            TaskStatus::InProgress,
            TaskStatus::Pending,
            HistoryEvent::Released,
        )
        .held_by("b");
        assert!(matches!(
            store.transition(&wrong_worker).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));

        let stale = Transition::new(
            task.id,
            TaskStatus::Failed,
            TaskStatus::Pending,
            HistoryEvent::RetryScheduled,
        );
        assert!(matches!(
            store.transition(&stale).await.unwrap_err(),
            OverseerError::Conflict(_)
        ));

        let missing = Transition::new(
            Uuid::new_v4(),
            TaskStatus::Failed,
            TaskStatus::Pending,
            HistoryEvent::RetryScheduled,
        );
        assert!(matches!(
            store.transition(&missing).await.unwrap_err(),
            OverseerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_block_requires_reason_and_is_listed() {
        let store = store();
        let task = Task::new("email", "x");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store.try_claim(task.id, "a", now).await.unwrap();

        let blocked = store
            .transition(
                &Transition::new(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Blocked,
                    HistoryEvent::Blocked,
                )
                .held_by("a")
                .blocked_on(BlockReason::Budget),
            )
            .await
            .unwrap();
        assert_eq!(blocked.block_reason, Some(BlockReason::Budget));
        assert!(blocked.assigned_worker.is_none());

        let listed = store
            .list_tasks(&TaskFilter::default().with_block_reason(BlockReason::Budget))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let counts = store.status_counts().await.unwrap();
        assert!(counts.contains(&(TaskStatus::Blocked, 1)));
        assert!(counts.contains(&(TaskStatus::Pending, 0)));
    }
}
