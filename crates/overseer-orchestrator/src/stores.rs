//! The set of store handles every component talks through.

use crate::config::StoreConfig;
use overseer_core::OverseerResult;
use overseer_store::{
    ApprovalStore, BudgetLedger, DeadLetterStore, EscalationStore, ScheduleStore, SqliteStore,
    TaskStore, WorkerRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// One handle per durable collection.
///
/// Usually all fields point at the same [`SqliteStore`]; tests swap single
/// collections for doubles with the `with_*` methods.
#[derive(Clone)]
pub struct Stores {
    /// Task records and their history.
    pub tasks: Arc<dyn TaskStore>,
    /// Worker registrations and heartbeats.
    pub workers: Arc<dyn WorkerRegistry>,
    /// Dead-letter entries.
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Approval requests.
    pub approvals: Arc<dyn ApprovalStore>,
    /// Escalation records.
    pub escalations: Arc<dyn EscalationStore>,
    /// Recurring definitions.
    pub schedules: Arc<dyn ScheduleStore>,
    /// Cost limits and allocations.
    pub budget: Arc<dyn BudgetLedger>,
}

impl Stores {
    /// Route every collection to one SQLite store.
    pub fn from_sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            tasks: store.clone(),
            workers: store.clone(),
            dead_letters: store.clone(),
            approvals: store.clone(),
            escalations: store.clone(),
            schedules: store.clone(),
            budget: store,
        }
    }

    /// Open the configured database file.
    pub fn open(config: &StoreConfig) -> OverseerResult<Self> {
        let store = SqliteStore::open(&config.path, Duration::from_millis(config.busy_timeout_ms))?;
        Ok(Self::from_sqlite(store))
    }

    /// Replace the budget ledger.
    pub fn with_budget(mut self, budget: Arc<dyn BudgetLedger>) -> Self {
        self.budget = budget;
        self
    }

    /// Replace the approval store.
    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalStore>) -> Self {
        self.approvals = approvals;
        self
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
