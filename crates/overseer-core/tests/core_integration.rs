#![allow(clippy::unwrap_used, clippy::expect_used)]

use overseer_core::state_machine::{is_allowed, validate};
use overseer_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Task serialization keeps lifecycle fields
// ---------------------------------------------------------------------------

#[test]
fn task_serialization_roundtrip() {
    let dep = Uuid::new_v4();
    let task = Task::new("email", "Send digest")
        .with_priority(Priority::High)
        .with_payload(serde_json::json!({"to": "ops@example.com"}))
        .with_dependencies(vec![dep])
        .with_estimated_cost(1.25)
        .with_approval(RiskLevel::High);

    let json = serde_json::to_string(&task).unwrap();
    let parsed: Task = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, task);
    assert!(json.contains("\"priority\":\"high\""));
    assert!(json.contains("\"status\":\"pending\""));
}

// ---------------------------------------------------------------------------
// 2. The happy path and the retry path are walkable through the table
// ---------------------------------------------------------------------------

#[test]
fn lifecycle_paths_are_allowed() {
    use TaskStatus::*;
    let happy = [Pending, InProgress, Completed];
    let retry_then_dead = [Pending, InProgress, Failed, Pending, InProgress, Failed, DeadLettered];
    let approval = [Pending, InProgress, WaitingApproval, Pending, InProgress, Completed];
    let budget = [Pending, InProgress, Blocked, Pending];
    let external = [Pending, InProgress, AwaitingExternalCompletion, Completed];

    for path in [&happy[..], &retry_then_dead, &approval, &budget, &external] {
        for pair in path.windows(2) {
            assert!(is_allowed(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }
}

#[test]
fn invalid_transition_is_reported_with_both_states() {
    let id = Uuid::new_v4();
    let err = validate(id, TaskStatus::Rejected, TaskStatus::Pending).unwrap_err();
    match err {
        OverseerError::InvalidTransition { task_id, from, to } => {
            assert_eq!(task_id, id);
            assert_eq!(from, TaskStatus::Rejected);
            assert_eq!(to, TaskStatus::Pending);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// 3. Fingerprints group repeated failures
// ---------------------------------------------------------------------------

#[test]
fn fingerprint_groups_repeated_failures() {
    let first = fingerprint("upstream returned 503 after 1200ms");
    let second = fingerprint("Upstream returned 503 after 980ms");
    let other = fingerprint("upstream returned invalid json");
    assert_eq!(first, second);
    assert_ne!(first, other);
}

// ---------------------------------------------------------------------------
// 4. Dead-letter requeue bookkeeping
// ---------------------------------------------------------------------------

#[test]
fn dead_letter_requeue_bounds() {
    let now = chrono::Utc::now();
    let task = Task::new("report", "r");
    let mut entry = DeadLetterEntry {
        task_id: task.id,
        snapshot: task,
        failure_reason: "boom".into(),
        fingerprint: fingerprint("boom"),
        failure_count: 1,
        retry_count: 0,
        max_retries: 1,
        status: DeadLetterStatus::Pending,
        resolution_note: None,
        first_failed_at: now,
        last_failure_at: now,
        updated_at: now,
    };
    assert!(entry.can_requeue());
    entry.retry_count = 1;
    assert!(!entry.can_requeue());
    entry.retry_count = 0;
    entry.status = DeadLetterStatus::Abandoned;
    assert!(!entry.can_requeue());
}
