//! Handler dispatch: task type → executable capability.
//!
//! The orchestrator never looks inside a handler. It hands over the task,
//! bounds the call with a timeout, turns panics and errors into failures,
//! and checks the returned evidence against the policy configured for the
//! task type.

use async_trait::async_trait;
use overseer_core::{OverseerError, OverseerResult, Task};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What a handler reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    /// Whether the handler succeeded.
    pub success: bool,
    /// Opaque result payload stored as completion evidence.
    #[serde(default)]
    pub evidence: serde_json::Value,
    /// Failure message when `success` is false.
    #[serde(default)]
    pub error: Option<String>,
    /// Cost actually incurred, when the handler knows it.
    #[serde(default)]
    pub actual_cost: Option<f64>,
    /// The work was handed off and will be confirmed elsewhere.
    #[serde(default)]
    pub awaiting_external: bool,
}

impl HandlerOutcome {
    /// Successful outcome carrying `evidence`.
    pub fn success(evidence: serde_json::Value) -> Self {
        Self {
            success: true,
            evidence,
            error: None,
            actual_cost: None,
            awaiting_external: false,
        }
    }

    /// Failed outcome with `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            evidence: serde_json::Value::Null,
            error: Some(error.into()),
            actual_cost: None,
            awaiting_external: false,
        }
    }

    /// Work handed off; completion will be reported externally.
    pub fn awaiting_external(evidence: serde_json::Value) -> Self {
        Self {
            awaiting_external: true,
            ..Self::success(evidence)
        }
    }

    /// Attaches the actual cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.actual_cost = Some(cost);
        self
    }

    /// Error text for a failed outcome.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "handler reported failure without an error message".to_string())
    }
}

/// A capability that executes tasks of one or more types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run the task. `Err` is treated exactly like a failed outcome.
    async fn execute(&self, task: &Task) -> OverseerResult<HandlerOutcome>;
}

/// What counts as acceptable completion evidence for a task type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidencePolicy {
    /// Anything, including nothing.
    #[default]
    Any,
    /// Not null, and not an empty string, array or object.
    NonEmpty,
    /// A JSON object carrying each named field with a non-null value.
    RequireFields(Vec<String>),
}

impl EvidencePolicy {
    /// `Err` carries the reason the evidence was refused.
    pub fn check(&self, evidence: &serde_json::Value) -> Result<(), String> {
        use serde_json::Value;
        match self {
            EvidencePolicy::Any => Ok(()),
            EvidencePolicy::NonEmpty => {
                let empty = match evidence {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    Value::Bool(_) | Value::Number(_) => false,
                };
                if empty {
                    Err("completion evidence is empty".to_string())
                } else {
                    Ok(())
                }
            }
            EvidencePolicy::RequireFields(fields) => {
                let Value::Object(map) = evidence else {
                    return Err("completion evidence must be an object".to_string());
                };
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| map.get(f.as_str()).map_or(true, Value::is_null))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("completion evidence is missing {}", missing.join(", ")))
                }
            }
        }
    }
}

/// Registry of handlers by task type, with an optional fallback.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
    evidence: HashMap<String, EvidencePolicy>,
}

impl HandlerRegistry {
    /// Empty registry with no fallback.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
            evidence: HashMap::new(),
        }
    }

    /// Registers `handler` for `task_type`; `*` sets the fallback.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!(task_type = %task_type, handler = handler.name(), "Registered task handler");
        self.handlers.insert(task_type, handler);
    }

    /// Handler for types nobody registered.
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        info!(handler = handler.name(), "Registered fallback handler");
        self.fallback = Some(handler);
    }

    /// Overrides the evidence policy for `task_type`.
    pub fn set_evidence_policy(&mut self, task_type: impl Into<String>, policy: EvidencePolicy) {
        self.evidence.insert(task_type.into(), policy);
    }

    /// Exact match first, then the fallback.
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Evidence policy for `task_type`.
    pub fn evidence_policy(&self, task_type: &str) -> EvidencePolicy {
        self.evidence.get(task_type).cloned().unwrap_or_default()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// True when a `*` handler is registered.
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `handler` on `task` in its own tokio task, bounded by `timeout`.
///
/// Errors, panics and timeouts all come back as failed outcomes; the
/// handler task is aborted on timeout.
pub async fn execute(
    handler: Arc<dyn TaskHandler>,
    task: Task,
    timeout: Duration,
) -> HandlerOutcome {
    let task_id = task.id;
    let name = handler.name().to_string();
    let join = tokio::spawn(async move { handler.execute(&task).await });
    let abort = join.abort_handle();

    match tokio::time::timeout(timeout, join).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => HandlerOutcome::failure(e.to_string()),
        Ok(Err(join_err)) if join_err.is_panic() => {
            let panic = join_err.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(task_id = %task_id, handler = %name, panic = %msg, "Handler panicked");
            HandlerOutcome::failure(format!("handler panicked: {msg}"))
        }
        Ok(Err(join_err)) => HandlerOutcome::failure(format!("handler was cancelled: {join_err}")),
        Err(_) => {
            abort.abort();
            warn!(task_id = %task_id, handler = %name, timeout = ?timeout, "Handler timed out");
            HandlerOutcome::failure(format!("handler timed out after {timeout:?}"))
        }
    }
}

/// Completes every task with its own payload as evidence.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, task: &Task) -> OverseerResult<HandlerOutcome> {
        Ok(HandlerOutcome::success(serde_json::json!({
            "task_type": task.task_type,
            "payload": task.payload,
        })))
    }
}

type HandlerFn = dyn Fn(&Task) -> OverseerResult<HandlerOutcome> + Send + Sync;

/// Wraps a synchronous closure as a handler.
pub struct FnHandler {
    name: String,
    func: Box<HandlerFn>,
}

impl FnHandler {
    /// Wraps `func` as a handler called `name`.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Task) -> OverseerResult<HandlerOutcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task) -> OverseerResult<HandlerOutcome> {
        (self.func)(task)
    }
}

/// Handler that always errors; stands in for a type whose handler is
/// registered but misconfigured.
pub struct UnavailableHandler {
    reason: String,
}

impl UnavailableHandler {
    /// Handler that fails every task with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl TaskHandler for UnavailableHandler {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn execute(&self, _task: &Task) -> OverseerResult<HandlerOutcome> {
        Err(OverseerError::Handler(self.reason.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _task: &Task) -> OverseerResult<HandlerOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(HandlerOutcome::success(json!({})))
        }
    }

    #[test]
    fn test_resolve_exact_then_fallback() {
        let mut registry = HandlerRegistry::new();
        let mailer = FnHandler::new("mailer", |_| Ok(HandlerOutcome::success(json!(1))));
        registry.register("email", Arc::new(mailer));
        assert_eq!(registry.resolve("email").unwrap().name(), "mailer");
        assert!(registry.resolve("report").is_none());

        registry.set_fallback(Arc::new(EchoHandler));
        assert_eq!(registry.resolve("report").unwrap().name(), "echo");
        assert_eq!(registry.resolve("email").unwrap().name(), "mailer");
        assert_eq!(registry.task_types(), vec!["email".to_string()]);
    }

    #[test]
    fn test_evidence_policies() {
        assert!(EvidencePolicy::Any.check(&json!(null)).is_ok());

        assert!(EvidencePolicy::NonEmpty.check(&json!(null)).is_err());
        assert!(EvidencePolicy::NonEmpty.check(&json!("  ")).is_err());
        assert!(EvidencePolicy::NonEmpty.check(&json!({})).is_err());
        assert!(EvidencePolicy::NonEmpty.check(&json!("sent")).is_ok());
        assert!(EvidencePolicy::NonEmpty.check(&json!(0)).is_ok());

        let policy = EvidencePolicy::RequireFields(vec!["commit".into(), "url".into()]);
        assert!(policy.check(&json!("merged")).is_err());
        let err = policy.check(&json!({"commit": "abc", "url": null})).unwrap_err();
        assert!(err.contains("url"));
        assert!(policy.check(&json!({"commit": "abc", "url": "https://x"})).is_ok());
    }

    #[test]
    fn test_evidence_policy_default_is_any() {
        let mut registry = HandlerRegistry::new();
        registry.set_evidence_policy("deploy", EvidencePolicy::NonEmpty);
        assert_eq!(registry.evidence_policy("deploy"), EvidencePolicy::NonEmpty);
        assert_eq!(registry.evidence_policy("email"), EvidencePolicy::Any);
    }

    #[tokio::test]
    async fn test_execute_maps_errors_and_panics() {
        let task = Task::new("email", "x");
        let failing: Arc<dyn TaskHandler> = Arc::new(UnavailableHandler::new("smtp down"));
        let outcome = execute(failing, task.clone(), Duration::from_secs(1)).await;
        assert!(!outcome.success);
        assert!(outcome.error_message().contains("smtp down"));

        let panicking: Arc<dyn TaskHandler> =
            Arc::new(FnHandler::new("boom", |_| panic!("exploded")));
        let outcome = execute(panicking, task, Duration::from_secs(1)).await;
        assert!(!outcome.success);
        assert!(outcome.error_message().contains("exploded"));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let outcome = execute(
            Arc::new(SlowHandler),
            Task::new("email", "x"),
            Duration::from_millis(50),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error_message().contains("timed out"));
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let task = Task::new("report", "x").with_payload(json!({"week": 42}));
        let outcome = execute(Arc::new(EchoHandler), task, Duration::from_secs(1)).await;
        assert!(outcome.success);
        assert_eq!(outcome.evidence["payload"]["week"], 42);
    }
}
