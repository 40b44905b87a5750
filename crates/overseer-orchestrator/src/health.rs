//! Worker liveness: registration, heartbeats and the staleness sweep that
//! returns a dead worker's tasks to the queue.

use crate::budget::BudgetEnforcer;
use chrono::{DateTime, Duration, Utc};
use overseer_core::{
    HistoryEvent, OverseerError, OverseerResult, TaskStatus, WorkerRecord, WorkerStatus,
};
use overseer_store::{TaskFilter, TaskStore, Transition, WorkerRegistry};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// What one health sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    /// Workers marked offline by this sweep.
    pub offline: Vec<String>,
    /// Tasks returned to `pending` from offline workers.
    pub reclaimed: Vec<Uuid>,
}

/// Tracks worker heartbeats and reclaims work from silent workers.
pub struct HealthMonitor {
    workers: Arc<dyn WorkerRegistry>,
    tasks: Arc<dyn TaskStore>,
    budget: Arc<BudgetEnforcer>,
    stale_after: Duration,
}

impl HealthMonitor {
    /// Monitor treating workers silent for `stale_after` as offline.
    pub fn new(
        workers: Arc<dyn WorkerRegistry>,
        tasks: Arc<dyn TaskStore>,
        budget: Arc<BudgetEnforcer>,
        stale_after: Duration,
    ) -> Self {
        Self {
            workers,
            tasks,
            budget,
            stale_after,
        }
    }

    /// Registers or reactivates a worker.
    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        self.workers.register(worker_id, capabilities, now).await
    }

    /// Records a heartbeat.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        current_task: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> OverseerResult<WorkerRecord> {
        self.workers.heartbeat(worker_id, current_task, now).await
    }

    /// Mark stale workers offline, then reclaim every in-progress task still
    /// assigned to an offline worker.
    ///
    /// Reclaim covers all offline workers, not only the ones marked in this
    /// sweep, so a sweep interrupted between the two steps is finished by
    /// the next one.
    pub async fn sweep(&self, now: DateTime<Utc>) -> OverseerResult<HealthReport> {
        let cutoff = now - self.stale_after;
        let mut report = HealthReport::default();

        for worker in self.workers.stale_workers(cutoff).await? {
            if self.workers.mark_offline(&worker.worker_id, cutoff).await? {
                tracing::warn!(
                    worker_id = %worker.worker_id,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker missed heartbeats, marked offline"
                );
                report.offline.push(worker.worker_id);
            }
        }

        let offline = self
            .workers
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Offline);
        for worker in offline {
            let filter = TaskFilter::default()
                .with_status(TaskStatus::InProgress)
                .with_worker(worker.worker_id.clone());
            for task in self.tasks.list_tasks(&filter).await? {
                let transition = Transition::new(
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Pending,
                    HistoryEvent::Reclaimed,
                )
                .at(now)
                .held_by(worker.worker_id.clone())
                .reason("worker offline")
                .available_at(now);
                match self.tasks.transition(&transition).await {
                    Ok(_) => {
                        tracing::info!(
                            task_id = %task.id,
                            worker_id = %worker.worker_id,
                            "Reclaimed task from offline worker"
                        );
                        self.budget.release_logged(task.id, now).await;
                        report.reclaimed.push(task.id);
                    }
                    // finished or released by its worker meanwhile
                    Err(OverseerError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    }
}
