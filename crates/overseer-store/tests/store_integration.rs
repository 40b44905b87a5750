#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, Utc};
use overseer_core::{HistoryEvent, Task, TaskStatus};
use overseer_store::{SqliteStore, TaskFilter, TaskStore, Transition};
use std::sync::{Arc, Barrier};
use std::time::Duration as StdDuration;

fn open(path: &std::path::Path) -> SqliteStore {
    SqliteStore::open(path, StdDuration::from_secs(10)).unwrap()
}

// ---------------------------------------------------------------------------
// 1. Exactly one of N independent connections wins the same task
// ---------------------------------------------------------------------------

#[test]
fn exactly_one_claim_wins_across_connections() {
    const WORKERS: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");

    let task = Task::new("email", "contended");
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(open(&path).insert_task(&task)).unwrap();
    let claim_at = Utc::now() + Duration::seconds(1);

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            std::thread::spawn(move || {
                let store = open(&path);
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                barrier.wait();
                rt.block_on(store.try_claim(task.id, &format!("worker-{i}"), claim_at))
                    .unwrap()
            })
        })
        .collect();

    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);

    let store = open(&path);
    let loaded = rt.block_on(store.get_task(task.id)).unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::InProgress);
    let claims = rt
        .block_on(store.history(task.id))
        .unwrap()
        .into_iter()
        .filter(|h| h.event == HistoryEvent::Claimed)
        .count();
    assert_eq!(claims, 1);
}

// ---------------------------------------------------------------------------
// 2. State written by one connection is visible to another
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stores_on_same_file_share_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("shared.db");
    let producer = open(&path);
    let worker = open(&path);

    let task = Task::new("report", "weekly");
    producer.insert_task(&task).await.unwrap();

    let now = Utc::now() + Duration::seconds(1);
    let ids = worker
        .claim_candidates("w", &["report".to_string()], 4, now)
        .await
        .unwrap();
    assert_eq!(ids, vec![task.id]);
    assert!(worker.try_claim(task.id, "w", now).await.unwrap());
    worker
        .transition(
            &Transition::new(
                task.id,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                HistoryEvent::Completed,
            )
            .held_by("w")
            .evidence(serde_json::json!({"rows": 3})),
        )
        .await
        .unwrap();

    let done = producer
        .list_tasks(&TaskFilter::default().with_status(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].completion_evidence, Some(serde_json::json!({"rows": 3})));
    assert!(done[0].completed_at.is_some());
}
