//! Subcommand execution. Every command prints its result as JSON on stdout.

use crate::{
    ApprovalAction, BudgetAction, Cli, Commands, DlqAction, EscalationAction, ScheduleAction,
    SubmitArgs, TaskAction, WorkerAction,
};
use chrono::Utc;
use overseer_core::{RiskLevel, Task};
use overseer_orchestrator::config::ScheduleConfig;
use overseer_orchestrator::{
    EchoHandler, FailureOutcome, HandlerRegistry, OperatorConsole, Orchestrator, OverseerConfig,
    Stores,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Handlers shipped with the binary. Deployments with real task types embed
/// the orchestrator crate and register their own.
pub(crate) fn builtin_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));
    registry
}

/// Load configuration, open the store and seed configured limits and
/// schedules.
pub(crate) async fn build(cli: &Cli) -> anyhow::Result<Arc<Orchestrator>> {
    let mut config = OverseerConfig::load(&cli.config).await?;
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    let stores = Stores::open(&config.store)?;
    tracing::debug!(db = %config.store.path.display(), "Store opened");
    let orchestrator = Orchestrator::new(stores, config, builtin_handlers());
    orchestrator.bootstrap(Utc::now()).await?;
    Ok(Arc::new(orchestrator))
}

pub(crate) async fn execute(cli: Cli) -> anyhow::Result<()> {
    let orchestrator = build(&cli).await?;
    let console = OperatorConsole::new(orchestrator.clone());
    let now = Utc::now();

    match cli.command {
        Commands::Run(args) => crate::runner::run(orchestrator, args).await?,
        Commands::Sweep => print(&console.sweep(now).await)?,
        Commands::Task { action } => task(&console, action).await?,
        Commands::Dlq { action } => match action {
            DlqAction::List { status } => print(&console.list_dead_letters(status).await?)?,
            DlqAction::Resolve { task_id, note } => {
                print(&console.resolve_dead_letter(task_id, note.as_deref(), now).await?)?;
            }
            DlqAction::Abandon { task_id, note } => {
                print(&console.abandon_dead_letter(task_id, note.as_deref(), now).await?)?;
            }
            DlqAction::Requeue { task_id } => {
                print(&console.requeue_dead_letter(task_id, now).await?)?;
            }
        },
        Commands::Approval { action } => match action {
            ApprovalAction::List { decision } => print(&console.list_approvals(decision).await?)?,
            ApprovalAction::Approve { id, reviewer, reason } => {
                let (request, task) = console
                    .approve(id, reviewer.as_deref(), reason.as_deref(), now)
                    .await?;
                print(&json!({ "approval": request, "task": task }))?;
            }
            ApprovalAction::Reject { id, reviewer, reason } => {
                let (request, task) = console
                    .reject(id, reviewer.as_deref(), reason.as_deref(), now)
                    .await?;
                print(&json!({ "approval": request, "task": task }))?;
            }
        },
        Commands::Schedule { action } => match action {
            ScheduleAction::List => print(&console.list_schedules().await?)?,
            ScheduleAction::Add {
                name,
                task_type,
                title,
                cron,
                interval,
                priority,
                payload,
            } => {
                let config = ScheduleConfig {
                    name,
                    task_type,
                    title,
                    cron,
                    interval_secs: interval,
                    priority,
                    payload: payload.unwrap_or(serde_json::Value::Null),
                };
                print(&console.add_schedule(&config, now).await?)?;
            }
            ScheduleAction::Enable { name } => {
                print(&console.set_schedule_enabled(&name, true).await?)?;
            }
            ScheduleAction::Disable { name } => {
                print(&console.set_schedule_enabled(&name, false).await?)?;
            }
        },
        Commands::Budget { action } => match action {
            BudgetAction::Show { scope } => print(&console.budget_status(scope, now).await?)?,
            BudgetAction::Set { scope, period, limit } => {
                let limits = console.set_budget_limit(&scope, period, limit).await?;
                print(&json!({ "scope": scope.key(), "limits": limits }))?;
            }
        },
        Commands::Worker { action } => match action {
            WorkerAction::List => print(&console.list_workers().await?)?,
            WorkerAction::Register { id, capabilities } => {
                print(&console.register_worker(&id, &capabilities, now).await?)?;
            }
            WorkerAction::Heartbeat { id, task } => {
                print(&console.heartbeat(&id, task, now).await?)?;
            }
        },
        Commands::Escalation { action } => match action {
            EscalationAction::List { status } => print(&console.list_escalations(status).await?)?,
            EscalationAction::Ack { id } => print(&console.acknowledge_escalation(id, now).await?)?,
        },
    }
    Ok(())
}

async fn task(console: &OperatorConsole, action: TaskAction) -> anyhow::Result<()> {
    let now = Utc::now();
    match action {
        TaskAction::Submit(args) => {
            let default_attempts = console.orchestrator().config().retry.default_max_attempts;
            print(&console.submit(new_task(args, default_attempts)).await?)?;
        }
        TaskAction::List { status, priority, limit } => {
            print(&console.list_tasks(status, priority, limit).await?)?;
        }
        TaskAction::Show { id } => print(&console.show_task(id).await?)?,
        TaskAction::Claim { id, worker } => print(&console.claim(id, &worker, now).await?)?,
        TaskAction::Release { id, worker, reason } => {
            print(&console.release(id, &worker, &reason, now).await?)?;
        }
        TaskAction::Complete { id, evidence, cost } => {
            let evidence = evidence.unwrap_or(serde_json::Value::Null);
            print(&console.complete(id, evidence, cost, now).await?)?;
        }
        TaskAction::Fail { id, error } => {
            let outcome = match console.fail(id, &error, now).await? {
                FailureOutcome::Retrying { task, retry_at } => {
                    json!({ "outcome": "retrying", "retry_at": retry_at, "task": task })
                }
                FailureOutcome::DeadLettered { task, entry } => {
                    json!({ "outcome": "dead_lettered", "dead_letter": entry, "task": task })
                }
            };
            print(&outcome)?;
        }
    }
    Ok(())
}

fn new_task(args: SubmitArgs, default_attempts: u32) -> Task {
    let mut task = Task::new(args.task_type, args.title)
        .with_max_attempts(args.max_attempts.unwrap_or(default_attempts))
        .with_dependencies(args.depends_on)
        .with_estimated_cost(args.estimated_cost);
    if let Some(description) = args.description {
        task = task.with_description(description);
    }
    if let Some(payload) = args.payload {
        task = task.with_payload(payload);
    }
    if let Some(priority) = args.priority {
        task = task.with_priority(priority);
    }
    if let Some(key) = args.dedupe_key {
        task = task.with_dedupe_key(key);
    }
    match (args.requires_approval, args.risk) {
        (true, risk) => task.with_approval(risk.unwrap_or(RiskLevel::Medium)),
        (false, Some(risk)) => task.with_risk_level(risk),
        (false, None) => task,
    }
}
