//! The polling loop one worker runs.
//!
//! A worker claims a task, processes it to its next resting state and
//! immediately polls again; it sleeps only when the queue has nothing for
//! it. Heartbeats are sent from a separate tokio task so a long handler
//! does not make the worker look dead.

use crate::engine::{Orchestrator, ProcessOutcome};
use chrono::Utc;
use overseer_core::OverseerResult;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Claims and processes tasks in a loop until shut down.
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    worker_id: String,
    capabilities: Vec<String>,
    current_task: Arc<Mutex<Option<Uuid>>>,
}

impl Worker {
    /// Worker `worker_id` advertising `capabilities`.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        worker_id: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            orchestrator,
            worker_id: worker_id.into(),
            capabilities,
            current_task: Arc::new(Mutex::new(None)),
        }
    }

    /// This worker's id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Task currently being processed, as reported in heartbeats.
    pub fn current_task(&self) -> Option<Uuid> {
        *self.current_task.lock()
    }

    /// One claim-and-process cycle. `None` when nothing was claimable.
    pub async fn run_once(&self) -> OverseerResult<Option<ProcessOutcome>> {
        let now = Utc::now();
        let Some(task) = self
            .orchestrator
            .claim_next(&self.worker_id, &self.capabilities, now)
            .await?
        else {
            return Ok(None);
        };

        *self.current_task.lock() = Some(task.id);
        self.beat().await;
        let task_id = task.id;
        let result = self.orchestrator.process(task, &self.worker_id, now).await;
        *self.current_task.lock() = None;

        match &result {
            Ok(outcome) => info!(
                worker_id = %self.worker_id,
                task_id = %task_id,
                outcome = outcome.label(),
                "Task processed"
            ),
            Err(e) => error!(
                worker_id = %self.worker_id,
                task_id = %task_id,
                error = %e,
                "Task processing failed"
            ),
        }
        result.map(Some)
    }

    /// Register, then poll until `shutdown` flips to `true` or its sender
    /// is dropped. A task already being processed is finished first; the
    /// worker is marked offline on the way out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> OverseerResult<()> {
        self.orchestrator
            .health()
            .register(&self.worker_id, &self.capabilities, Utc::now())
            .await?;
        let heartbeat = self.spawn_heartbeat(shutdown.clone());
        let poll_interval = self.orchestrator.config().worker.poll_interval();
        info!(worker_id = %self.worker_id, capabilities = ?self.capabilities, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                // already logged; back off as if idle
                Err(_) => true,
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        heartbeat.abort();
        let workers = &self.orchestrator.stores().workers;
        if let Err(e) = workers.set_worker_offline(&self.worker_id).await {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to mark worker offline");
        }
        info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    async fn beat(&self) {
        let current = self.current_task();
        let health = self.orchestrator.health();
        if let Err(e) = health.heartbeat(&self.worker_id, current, Utc::now()).await {
            warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed");
        }
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let worker_id = self.worker_id.clone();
        let current_task = self.current_task.clone();
        let period = orchestrator.config().worker.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let current = *current_task.lock();
                        let beat = orchestrator.health().heartbeat(&worker_id, current, Utc::now());
                        if let Err(e) = beat.await {
                            warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OverseerConfig;
    use crate::dispatch::{FnHandler, HandlerOutcome, HandlerRegistry};
    use crate::stores::Stores;
    use overseer_core::{Task, TaskStatus, WorkerStatus};
    use overseer_store::{SqliteStore, TaskStore, WorkerRegistry};
    use std::time::Duration;

    fn orchestrator(store: SqliteStore) -> Arc<Orchestrator> {
        let mut config = OverseerConfig::default();
        config.worker.poll_interval_ms = 10;
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "echo",
            Arc::new(FnHandler::new("echo", |t: &Task| {
                Ok(HandlerOutcome::success(t.payload.clone()))
            })),
        );
        Arc::new(Orchestrator::new(Stores::from_sqlite(store), config, handlers))
    }

    #[tokio::test]
    async fn test_run_once_idle_and_busy() {
        let orch = orchestrator(SqliteStore::open_in_memory().unwrap());
        let worker = Worker::new(orch.clone(), "w1", vec!["echo".into()]);
        assert!(worker.run_once().await.unwrap().is_none());

        let mut task = Task::new("echo", "x");
        task.created_at -= chrono::Duration::seconds(1);
        task.available_at = task.created_at;
        orch.submit(&task).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome.label(), "completed");
        assert!(worker.current_task().is_none());
        let record = orch.stores().workers.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(record.current_task, Some(task.id));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let orch = orchestrator(SqliteStore::open_in_memory().unwrap());
        let mut task = Task::new("echo", "x");
        task.available_at -= chrono::Duration::seconds(1);
        orch.submit(&task).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = Worker::new(orch.clone(), "w1", vec!["*".into()]);
        let handle = tokio::spawn(worker.run(rx));

        let mut completed = false;
        for _ in 0..200 {
            let status = orch.stores().tasks.get_task(task.id).await.unwrap().unwrap().status;
            if status == TaskStatus::Completed {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed, "worker never completed the task");

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        let record = orch.stores().workers.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Offline);
    }
}
