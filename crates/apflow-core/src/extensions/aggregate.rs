//! Built-in `aggregate_results` executor: returns its dependency-merged
//! inputs as the result. The canonical downstream leaf for fanning results
//! back together under one task.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use apflow_db::models::JsonMap;

use crate::extensions::executor::{Executor, ExecutorInit, ExecutorResult};
use crate::extensions::registry::{ExtensionMeta, ExtensionRegistry, RegistryError};

pub struct AggregateResultsExecutor {
    cancellation: CancellationToken,
}

impl AggregateResultsExecutor {
    pub const ID: &'static str = "aggregate_results";

    pub fn new(init: &ExecutorInit) -> Self {
        Self {
            cancellation: init.cancellation.clone(),
        }
    }

    /// Register this executor on a registry under [`Self::ID`].
    pub fn register(registry: &ExtensionRegistry) -> Result<(), RegistryError> {
        registry.register_executor(
            ExtensionMeta::executor(Self::ID, "core")
                .with_name("Aggregate results")
                .with_description("Collects dependency-merged inputs into a single result"),
            std::sync::Arc::new(|init| {
                Ok(Box::new(AggregateResultsExecutor::new(&init)) as Box<dyn Executor>)
            }),
        )
    }
}

#[async_trait]
impl Executor for AggregateResultsExecutor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn type_name(&self) -> &str {
        "core"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "additionalProperties": true})
    }

    async fn execute(&self, inputs: &JsonMap) -> Result<ExecutorResult> {
        if self.cancellation.is_cancelled() {
            return Ok(ExecutorResult::cancelled("cancelled before aggregation"));
        }

        let mut payload = inputs.clone();
        payload.insert("aggregated_count".to_owned(), json!(inputs.len()));
        Ok(ExecutorResult::success(Value::Object(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_inputs_with_count() {
        let executor =
            AggregateResultsExecutor::new(&ExecutorInit::new(JsonMap::new(), JsonMap::new()));
        let mut inputs = JsonMap::new();
        inputs.insert("cores".to_owned(), json!(8));
        inputs.insert("system".to_owned(), json!("linux"));

        let result = executor.execute(&inputs).await.unwrap();
        assert!(result.status.is_success());
        let payload = result.result.unwrap();
        assert_eq!(payload["cores"], json!(8));
        assert_eq!(payload["aggregated_count"], json!(2));
    }

    #[tokio::test]
    async fn empty_inputs_still_succeed() {
        let executor =
            AggregateResultsExecutor::new(&ExecutorInit::new(JsonMap::new(), JsonMap::new()));
        let result = executor.execute(&JsonMap::new()).await.unwrap();
        let payload = result.result.unwrap();
        assert_eq!(payload["aggregated_count"], json!(0));
    }
}
