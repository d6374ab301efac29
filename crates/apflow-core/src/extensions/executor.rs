//! The `Executor` trait -- the plugin interface for running a single task.
//!
//! Each concrete executor (shell, HTTP, agent runner, ...) implements this
//! trait. The trait is intentionally object-safe so it can be stored as
//! `Box<dyn Executor>` and created per task execution through the
//! [`super::ExtensionRegistry`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use apflow_db::models::JsonMap;

/// Outcome status reported by an executor.
///
/// `success` and `completed` are equivalent terminal-success markers;
/// different executor families historically report one or the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::Completed)
    }
}

/// The map an executor returns from [`Executor::execute`].
///
/// `extra` preserves executor-specific fields verbatim so they survive the
/// round-trip into the persisted row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Value>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl ExecutorResult {
    pub fn success(result: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            result: Some(result),
            error: None,
            token_usage: None,
            extra: JsonMap::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(error.into()),
            token_usage: None,
            extra: JsonMap::new(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            result: None,
            error: Some(message.into()),
            token_usage: None,
            extra: JsonMap::new(),
        }
    }

    pub fn with_token_usage(mut self, token_usage: Value) -> Self {
        self.token_usage = Some(token_usage);
        self
    }
}

/// Construction parameters handed to an executor factory for one task
/// execution.
///
/// `cancellation` is the manager's cancellation state for the tree; an
/// executor must observe it instead of reaching into the database.
#[derive(Debug, Clone)]
pub struct ExecutorInit {
    pub inputs: JsonMap,
    pub params: JsonMap,
    pub cancellation: CancellationToken,
}

impl ExecutorInit {
    pub fn new(inputs: JsonMap, params: JsonMap) -> Self {
        Self {
            inputs,
            params,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Plugin interface for running a single task.
///
/// # Object Safety
///
/// This trait is object-safe: every method returns a concrete type, so
/// instances can be stored as `Box<dyn Executor>`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Globally unique executor id (the `schemas.method` key).
    fn id(&self) -> &str;

    /// Category tag used by the registry's secondary index.
    fn type_name(&self) -> &str;

    /// When false the manager never calls [`Executor::cancel`] mid-run; the
    /// executor finishes and the row is reconciled afterwards.
    fn cancelable(&self) -> bool {
        false
    }

    /// JSON-schema-shaped description of the accepted inputs.
    fn input_schema(&self) -> Value;

    /// Run the task. Must return a result map with a `status` and, on
    /// success, a `result` payload; must honor the cancellation token it
    /// was constructed with.
    async fn execute(&self, inputs: &JsonMap) -> Result<ExecutorResult>;

    /// Called only when `cancelable()` is true and cancellation has been
    /// requested. Should return promptly with any partial result and
    /// token usage.
    async fn cancel(&self) -> ExecutorResult {
        ExecutorResult::cancelled("cancellation requested")
    }
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id())
            .field("type_name", &self.type_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn id(&self) -> &str {
            "noop"
        }

        fn type_name(&self) -> &str {
            "test"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _inputs: &JsonMap) -> Result<ExecutorResult> {
            Ok(ExecutorResult::success(json!({"ok": true})))
        }
    }

    #[test]
    fn executor_is_object_safe() {
        let executor: Box<dyn Executor> = Box::new(NoopExecutor);
        assert_eq!(executor.id(), "noop");
        assert!(!executor.cancelable());
    }

    #[tokio::test]
    async fn noop_executor_succeeds() {
        let executor = NoopExecutor;
        let result = executor.execute(&JsonMap::new()).await.unwrap();
        assert!(result.status.is_success());
        assert_eq!(result.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn default_cancel_reports_cancelled() {
        let executor = NoopExecutor;
        let result = executor.cancel().await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn executor_result_roundtrips_with_extra_fields() {
        let value = json!({
            "status": "success",
            "result": {"cores": 8},
            "token_usage": {"input": 10, "output": 3},
            "trace_id": "abc-123"
        });
        let parsed: ExecutorResult = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(parsed.status, ExecutionStatus::Success);
        assert_eq!(parsed.extra.get("trace_id"), Some(&json!("abc-123")));
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn success_and_completed_both_terminal_success() {
        assert!(ExecutionStatus::Success.is_success());
        assert!(ExecutionStatus::Completed.is_success());
        assert!(!ExecutionStatus::Failed.is_success());
        assert!(!ExecutionStatus::Cancelled.is_success());
    }
}
