//! `overseer run`: workers and sweep loops in one process until Ctrl-C.

use crate::RunArgs;
use overseer_orchestrator::{spawn_sweeps, Orchestrator, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub(crate) async fn run(orchestrator: Arc<Orchestrator>, args: RunArgs) -> anyhow::Result<()> {
    if args.workers == 0 && args.no_sweeps {
        anyhow::bail!("nothing to run: zero workers and sweeps disabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(args.workers);
    for n in 1..=args.workers {
        let worker_id = format!("{}-{n}", args.prefix);
        let worker =
            Worker::new(orchestrator.clone(), worker_id.clone(), args.capabilities.clone());
        let shutdown = shutdown_rx.clone();
        let id = worker_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                error!(worker_id = %id, error = %e, "Worker exited with error");
            }
        });
        workers.push((worker_id, handle));
    }

    let sweeps = if args.no_sweeps {
        Vec::new()
    } else {
        spawn_sweeps(orchestrator.clone(), shutdown_rx.clone())
    };

    info!(
        workers = args.workers,
        sweeps = sweeps.len(),
        db = %orchestrator.config().store.path.display(),
        "Overseer running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight tasks");
    let _ = shutdown_tx.send(true);

    // a worker finishes the task it holds, bounded by the handler timeout
    let grace = orchestrator.config().worker.handler_timeout() + Duration::from_secs(5);
    let drained = tokio::time::timeout(grace, async {
        for (worker_id, handle) in workers {
            if let Err(e) = handle.await {
                warn!(worker_id = %worker_id, error = %e, "Worker task panicked");
            }
        }
        for handle in sweeps {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep task panicked");
            }
        }
    })
    .await;

    match drained {
        Ok(()) => info!("Overseer stopped"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "Shutdown grace period elapsed, exiting"),
    }
    Ok(())
}
