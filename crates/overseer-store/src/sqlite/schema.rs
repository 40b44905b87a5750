use rusqlite::Connection;

/// Idempotent DDL. Timestamps are UTC epoch milliseconds.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    task_type           TEXT NOT NULL,
    title               TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    payload             TEXT NOT NULL DEFAULT 'null',
    priority_rank       INTEGER NOT NULL,
    status              TEXT NOT NULL,
    assigned_worker     TEXT,
    attempt_count       INTEGER NOT NULL DEFAULT 0,
    max_attempts        INTEGER NOT NULL,
    estimated_cost      REAL NOT NULL DEFAULT 0,
    actual_cost         REAL,
    requires_approval   INTEGER NOT NULL DEFAULT 0,
    risk_level          TEXT NOT NULL,
    completion_evidence TEXT,
    error_message       TEXT,
    block_reason        TEXT,
    available_at        INTEGER NOT NULL,
    avoid_worker        TEXT,
    avoid_until         INTEGER,
    last_worker         TEXT,
    schedule_name       TEXT,
    dedupe_key          TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER NOT NULL,
    started_at          INTEGER,
    completed_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tasks_eligible ON tasks(status, priority_rank, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(assigned_worker, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedupe ON tasks(dedupe_key)
    WHERE dedupe_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id    TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS task_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL,
    event       TEXT NOT NULL,
    from_status TEXT,
    to_status   TEXT,
    worker_id   TEXT,
    reason      TEXT,
    fingerprint TEXT,
    at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id, id);

CREATE TABLE IF NOT EXISTS workers (
    worker_id      TEXT PRIMARY KEY,
    capabilities   TEXT NOT NULL DEFAULT '[]',
    status         TEXT NOT NULL,
    current_task   TEXT,
    last_heartbeat INTEGER NOT NULL,
    registered_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workers_staleness ON workers(status, last_heartbeat);

CREATE TABLE IF NOT EXISTS dead_letters (
    task_id         TEXT PRIMARY KEY,
    snapshot        TEXT NOT NULL,
    failure_reason  TEXT NOT NULL,
    fingerprint     TEXT NOT NULL,
    failure_count   INTEGER NOT NULL DEFAULT 1,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    status          TEXT NOT NULL,
    resolution_note TEXT,
    first_failed_at INTEGER NOT NULL,
    last_failure_at INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_status ON dead_letters(status, last_failure_at);

CREATE TABLE IF NOT EXISTS approvals (
    id              TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL,
    risk_level      TEXT NOT NULL,
    decision        TEXT NOT NULL,
    applied_default TEXT,
    reason          TEXT,
    reviewer        TEXT,
    created_at      INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL,
    decided_at      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_approvals_pending ON approvals(decision, expires_at);
CREATE INDEX IF NOT EXISTS idx_approvals_task ON approvals(task_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_one_open
    ON approvals(task_id) WHERE decision = 'pending';

CREATE TABLE IF NOT EXISTS escalations (
    id              TEXT PRIMARY KEY,
    dedupe_key      TEXT NOT NULL,
    task_id         TEXT,
    severity        TEXT NOT NULL,
    source          TEXT,
    reason          TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    acknowledged_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_escalations_key ON escalations(dedupe_key, created_at);

CREATE TABLE IF NOT EXISTS scheduled_definitions (
    name                     TEXT PRIMARY KEY,
    task_type                TEXT NOT NULL,
    title                    TEXT NOT NULL,
    payload                  TEXT NOT NULL DEFAULT 'null',
    priority_rank            INTEGER NOT NULL,
    recurrence               TEXT NOT NULL,
    next_run_at              INTEGER NOT NULL,
    last_run_at              INTEGER,
    last_run_status          TEXT,
    last_task_id             TEXT,
    consecutive_failures     INTEGER NOT NULL DEFAULT 0,
    max_consecutive_failures INTEGER NOT NULL,
    enabled                  INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_schedules_due ON scheduled_definitions(enabled, next_run_at);

CREATE TABLE IF NOT EXISTS resource_allocations (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL,
    worker_id      TEXT NOT NULL,
    estimated_cost REAL NOT NULL,
    actual_cost    REAL,
    status         TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    finalized_at   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_allocations_task ON resource_allocations(task_id, status);
CREATE INDEX IF NOT EXISTS idx_allocations_period ON resource_allocations(created_at, worker_id);

CREATE TABLE IF NOT EXISTS budget_limits (
    scope   TEXT PRIMARY KEY,
    daily   REAL,
    weekly  REAL,
    monthly REAL
);
";

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
