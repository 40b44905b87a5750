//! Task orchestration on top of the Overseer store.
//!
//! Workers share one durable task table and coordinate only through its
//! conditional updates: there is no leader and no in-process queue. This
//! crate holds everything that runs against that table: the claim protocol,
//! the pre-dispatch gates, handler dispatch, retries and dead-lettering,
//! the periodic sweeps and the worker loop.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Wires every component to a set of [`Stores`] and processes claimed tasks.
//! - [`Worker`]: Polling loop with its own heartbeat, stopped through a `watch` channel.
//! - [`HandlerRegistry`]: Maps task types to [`TaskHandler`]s with an optional fallback.
//! - [`OperatorConsole`]: Administrative operations used by the CLI.
//! - [`OverseerConfig`]: TOML configuration with defaults for every field.

/// Human sign-off for risky tasks.
pub mod approval;
/// Fail-closed cost limits and allocations.
pub mod budget;
/// Conditional claim and release.
pub mod claim;
/// TOML configuration.
pub mod config;
/// Handler trait, registry and bounded execution.
pub mod dispatch;
/// Claimed-task processing.
pub mod engine;
/// Escalation records and the approval/stuck-task sweep.
pub mod escalation;
/// Fail-closed gate evaluation.
pub mod gate;
/// Heartbeats and stale-worker reclaim.
pub mod health;
/// Administrative operations.
pub mod operator;
/// Retry backoff and dead-lettering.
pub mod retry;
/// Recurring task generation.
pub mod scheduler;
/// Store handles.
pub mod stores;
/// Periodic sweep runner.
pub mod sweeper;
/// Worker polling loop.
pub mod worker;

pub use approval::{ApprovalCheck, ApprovalGate, ApprovalPolicy};
pub use budget::{BudgetDecision, BudgetEnforcer};
pub use claim::ClaimProtocol;
pub use config::OverseerConfig;
pub use dispatch::{
    EchoHandler, EvidencePolicy, FnHandler, HandlerOutcome, HandlerRegistry, TaskHandler,
    UnavailableHandler,
};
pub use engine::{Orchestrator, ProcessOutcome};
pub use escalation::{EscalationManager, EscalationReport, Escalator};
pub use gate::{fail_closed, Gate, GateDecision};
pub use health::{HealthMonitor, HealthReport};
pub use operator::{BudgetStatus, OperatorConsole, Submission, TaskDetail};
pub use retry::{FailureOutcome, RetryManager, RetryPolicy};
pub use scheduler::{Scheduler, TickReport};
pub use stores::Stores;
pub use sweeper::{spawn_sweeps, sweep_all, SweepKind, SweepReport};
pub use worker::Worker;
