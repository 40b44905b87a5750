//! Command-line front end for the Overseer orchestrator.
//!
//! Runs worker pools and exposes the operator console.

mod commands;
mod runner;

use clap::{Args, Parser, Subcommand};
use overseer_core::{
    ApprovalDecision, BudgetPeriod, BudgetScope, DeadLetterStatus, EscalationStatus, OverseerError,
    Priority, RiskLevel, TaskStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "overseer", about = "Overseer: durable multi-worker task orchestrator", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "overseer.toml")]
    config: PathBuf,

    /// Database file (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start workers and the periodic sweeps
    Run(RunArgs),
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Inspect and act on dead-lettered tasks
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Review approval requests
    Approval {
        #[command(subcommand)]
        action: ApprovalAction,
    },
    /// Manage recurring task definitions
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Show usage and set cost limits
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },
    /// Worker registry
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Escalations raised for operators
    Escalation {
        #[command(subcommand)]
        action: EscalationAction,
    },
    /// Run every sweep once and print what it did
    Sweep,
}

#[derive(Args)]
struct RunArgs {
    /// Number of workers to start in this process
    #[arg(short, long, default_value_t = 1)]
    workers: usize,
    /// Worker id prefix; ids are `<prefix>-<n>`
    #[arg(long, default_value = "worker")]
    prefix: String,
    /// Task types these workers accept (`*` for any)
    #[arg(long = "capability", default_value = "*")]
    capabilities: Vec<String>,
    /// Start workers only, without the sweep loops
    #[arg(long)]
    no_sweeps: bool,
}

#[derive(Args)]
struct SubmitArgs {
    /// Task type, used to pick the handler
    #[arg(long = "type")]
    task_type: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    /// JSON payload
    #[arg(long)]
    payload: Option<serde_json::Value>,
    #[arg(long)]
    priority: Option<Priority>,
    /// Defaults to `retry.default_max_attempts`
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Task that must complete first (repeatable)
    #[arg(long = "depends-on")]
    depends_on: Vec<Uuid>,
    #[arg(long, default_value_t = 0.0)]
    estimated_cost: f64,
    /// Require human approval before execution
    #[arg(long)]
    requires_approval: bool,
    #[arg(long)]
    risk: Option<RiskLevel>,
    /// Idempotency key; a second submission with the same key is ignored
    #[arg(long)]
    dedupe_key: Option<String>,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a new task
    Submit(SubmitArgs),
    /// List tasks
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a task with its history, approval, dead-letter entry and allocations
    Show { id: Uuid },
    /// Claim a specific task for a worker
    Claim {
        id: Uuid,
        #[arg(long)]
        worker: String,
    },
    /// Return an in-progress task to the queue
    Release {
        id: Uuid,
        #[arg(long)]
        worker: String,
        #[arg(long, default_value = "released by operator")]
        reason: String,
    },
    /// Mark a task completed
    Complete {
        id: Uuid,
        /// JSON completion evidence
        #[arg(long)]
        evidence: Option<serde_json::Value>,
        #[arg(long)]
        cost: Option<f64>,
    },
    /// Record a failure for a task
    Fail {
        id: Uuid,
        #[arg(long)]
        error: String,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-letter entries
    List {
        #[arg(long)]
        status: Option<DeadLetterStatus>,
    },
    /// Close an entry as handled
    Resolve {
        task_id: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Close an entry without further action
    Abandon {
        task_id: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Put the task back in the queue with a fresh attempt budget
    Requeue { task_id: Uuid },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List approval requests
    List {
        #[arg(long)]
        decision: Option<ApprovalDecision>,
    },
    /// Approve a pending request
    Approve {
        id: Uuid,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reject a pending request
    Reject {
        id: Uuid,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List definitions
    List,
    /// Add a definition
    Add {
        #[arg(long)]
        name: String,
        #[arg(long = "type")]
        task_type: String,
        #[arg(long)]
        title: Option<String>,
        /// Cron expression, seconds field first
        #[arg(long, conflicts_with = "interval")]
        cron: Option<String>,
        /// Fixed interval in seconds
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        payload: Option<serde_json::Value>,
    },
    /// Enable a definition
    Enable { name: String },
    /// Disable a definition
    Disable { name: String },
}

#[derive(Subcommand)]
enum BudgetAction {
    /// Show limits and current usage
    Show {
        /// `global` or `worker:<id>`; all scopes when omitted
        #[arg(long)]
        scope: Option<BudgetScope>,
    },
    /// Set or clear a limit
    Set {
        #[arg(long, default_value = "global")]
        scope: BudgetScope,
        /// daily, weekly or monthly
        #[arg(long)]
        period: BudgetPeriod,
        /// Omit to remove the limit
        #[arg(long)]
        limit: Option<f64>,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// List registered workers
    List,
    /// Register or refresh a worker
    Register {
        id: String,
        #[arg(long = "capability", default_value = "*")]
        capabilities: Vec<String>,
    },
    /// Record a heartbeat
    Heartbeat {
        id: String,
        #[arg(long)]
        task: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum EscalationAction {
    /// List escalations, newest first
    List {
        #[arg(long)]
        status: Option<EscalationStatus>,
    },
    /// Acknowledge an escalation
    Ack { id: Uuid },
}

/// Exit status for a failed command: the store's error classification when
/// there is one, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<OverseerError>()
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}
