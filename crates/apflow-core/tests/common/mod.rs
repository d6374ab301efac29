//! Shared helpers for apflow-core integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use apflow_core::extensions::{
    ExecutionStatus, Executor, ExecutorInit, ExecutorResult, ExtensionMeta, ExtensionRegistry,
    register_builtin_executors,
};
use apflow_db::models::JsonMap;

/// Registry with the built-in executors plus the test executors below.
pub fn test_registry() -> Arc<ExtensionRegistry> {
    let registry = Arc::new(ExtensionRegistry::new());
    register_builtin_executors(&registry).expect("builtins register");
    EmitExecutor::register(&registry);
    SlowCancelableExecutor::register(&registry);
    registry
}

/// Test executor that echoes `inputs.payload` (or the whole input map) as
/// its result. `fail: true` makes it report failure, `sleep_ms` delays it,
/// and `token_usage` is passed through.
pub struct EmitExecutor;

impl EmitExecutor {
    pub const ID: &'static str = "emit";

    pub fn register(registry: &ExtensionRegistry) {
        registry
            .register_executor(
                ExtensionMeta::executor(Self::ID, "test"),
                Arc::new(|_init| Ok(Box::new(EmitExecutor) as Box<dyn Executor>)),
            )
            .expect("emit registers");
    }
}

#[async_trait]
impl Executor for EmitExecutor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn type_name(&self) -> &str {
        "test"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "additionalProperties": true})
    }

    async fn execute(&self, inputs: &JsonMap) -> Result<ExecutorResult> {
        if let Some(ms) = inputs.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }

        let token_usage = inputs.get("token_usage").cloned();
        if inputs.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            let mut result = ExecutorResult::failed("requested failure");
            result.token_usage = token_usage;
            return Ok(result);
        }

        let payload = inputs
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(inputs.clone()));
        let mut result = ExecutorResult::success(payload);
        result.token_usage = token_usage;
        Ok(result)
    }
}

/// Cancelable test executor: sleeps for `duration_ms` (default 10s) unless
/// cancelled first. `cancel()` reports a partial result with token usage.
pub struct SlowCancelableExecutor {
    cancellation: CancellationToken,
}

impl SlowCancelableExecutor {
    pub const ID: &'static str = "slow_cancelable";

    pub fn register(registry: &ExtensionRegistry) {
        registry
            .register_executor(
                ExtensionMeta::executor(Self::ID, "test"),
                Arc::new(|init: ExecutorInit| {
                    Ok(Box::new(SlowCancelableExecutor {
                        cancellation: init.cancellation.clone(),
                    }) as Box<dyn Executor>)
                }),
            )
            .expect("slow_cancelable registers");
    }
}

#[async_trait]
impl Executor for SlowCancelableExecutor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn type_name(&self) -> &str {
        "test"
    }

    fn cancelable(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {"duration_ms": {"type": "integer"}}})
    }

    async fn execute(&self, inputs: &JsonMap) -> Result<ExecutorResult> {
        let duration = inputs
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(10_000);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(duration)) => {
                Ok(ExecutorResult::success(json!({"done": true})))
            }
            _ = self.cancellation.cancelled() => Ok(self.cancel().await),
        }
    }

    async fn cancel(&self) -> ExecutorResult {
        ExecutorResult {
            status: ExecutionStatus::Cancelled,
            result: Some(json!({"partial": true})),
            error: Some("cancelled by request".to_owned()),
            token_usage: Some(json!({"input": 5, "output": 7})),
            extra: JsonMap::new(),
        }
    }
}

/// Tracks current and peak concurrent executions for fan-out tests.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Test executor that records concurrency through a shared [`Gauge`].
pub struct GaugeExecutor {
    gauge: Arc<Gauge>,
}

impl GaugeExecutor {
    pub const ID: &'static str = "gauge";

    pub fn register(registry: &ExtensionRegistry, gauge: Arc<Gauge>) {
        registry
            .register_executor(
                ExtensionMeta::executor(Self::ID, "test"),
                Arc::new(move |_init| {
                    Ok(Box::new(GaugeExecutor {
                        gauge: Arc::clone(&gauge),
                    }) as Box<dyn Executor>)
                }),
            )
            .expect("gauge registers");
    }
}

#[async_trait]
impl Executor for GaugeExecutor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn type_name(&self) -> &str {
        "test"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _inputs: &JsonMap) -> Result<ExecutorResult> {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutorResult::success(json!({"ran": true})))
    }
}
