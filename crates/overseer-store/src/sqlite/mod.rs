//! SQLite-backed implementation of every store trait.
//!
//! One [`SqliteStore`] owns one connection. Several stores (in one process or
//! many) may open the same file; they coordinate only through conditional
//! updates and SQLite's own locking (WAL journal plus a busy timeout).
//! Multi-statement operations run in `BEGIN IMMEDIATE` transactions so the
//! guard read and the write see the same state.

mod approvals;
mod budget;
mod dead_letters;
mod escalations;
mod rows;
mod schedules;
mod schema;
mod tasks;
mod workers;

use crate::error::{StoreError, StoreResult};
use overseer_core::OverseerResult;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default time a writer waits for the database lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared-file SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> OverseerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StoreError::from)?;
        let conn = Self::configure(conn, busy_timeout)?;
        tracing::debug!(path = %path.display(), "opened task store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> OverseerResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        let conn = Self::configure(conn, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> StoreResult<Connection> {
        conn.busy_timeout(busy_timeout)?;
        // journal_mode returns a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        schema::init(&conn)?;
        Ok(conn)
    }

    /// Run `f` against the connection.
    async fn with_conn<T, F>(&self, f: F) -> OverseerResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send,
        T: Send,
    {
        let mut conn = self.conn.lock().await;
        f(&mut conn).map_err(Into::into)
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on `Ok`.
    async fn with_tx<T, F>(&self, f: F) -> OverseerResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send,
        T: Send,
    {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}
