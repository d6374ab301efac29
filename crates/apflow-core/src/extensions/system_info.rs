//! Built-in `system_info` executor: reports basic host facts for the
//! requested resource. Mostly useful for demos and wiring tests, which is
//! also why it honors the config registry's demo sleep scale.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use apflow_db::models::JsonMap;

use crate::config::global_config;
use crate::extensions::executor::{Executor, ExecutorInit, ExecutorResult};
use crate::extensions::registry::{ExtensionMeta, ExtensionRegistry, RegistryError};

const VALID_RESOURCES: &[&str] = &["cpu", "memory", "disk", "all"];

pub struct SystemInfoExecutor {
    cancellation: CancellationToken,
}

impl SystemInfoExecutor {
    pub const ID: &'static str = "system_info";

    pub fn new(init: &ExecutorInit) -> Self {
        Self {
            cancellation: init.cancellation.clone(),
        }
    }

    /// Register this executor on a registry under [`Self::ID`].
    pub fn register(registry: &ExtensionRegistry) -> Result<(), RegistryError> {
        registry.register_executor(
            ExtensionMeta::executor(Self::ID, "stdio")
                .with_name("System information")
                .with_description("Reports CPU, memory, and disk facts for the host"),
            std::sync::Arc::new(|init| {
                Ok(Box::new(SystemInfoExecutor::new(&init)) as Box<dyn Executor>)
            }),
        )
    }

    fn cpu_info() -> JsonMap {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1);
        let mut info = JsonMap::new();
        info.insert("cores".to_owned(), json!(cores));
        info.insert("architecture".to_owned(), json!(std::env::consts::ARCH));
        info.insert("system".to_owned(), json!(std::env::consts::OS));
        info
    }

    fn memory_info() -> JsonMap {
        let mut info = JsonMap::new();
        info.insert("system".to_owned(), json!(std::env::consts::OS));
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                let Some((key, rest)) = line.split_once(':') else {
                    continue;
                };
                let kb = rest
                    .trim()
                    .trim_end_matches(" kB")
                    .parse::<i64>()
                    .unwrap_or(0);
                match key {
                    "MemTotal" => {
                        info.insert("total_kb".to_owned(), json!(kb));
                    }
                    "MemAvailable" => {
                        info.insert("available_kb".to_owned(), json!(kb));
                    }
                    _ => {}
                }
            }
        }
        info
    }

    fn disk_info() -> JsonMap {
        let mut info = JsonMap::new();
        info.insert("system".to_owned(), json!(std::env::consts::OS));
        if let Ok(cwd) = std::env::current_dir() {
            info.insert("path".to_owned(), json!(cwd.display().to_string()));
        }
        info
    }

    async fn demo_sleep(inputs: &JsonMap) {
        let Some(seconds) = inputs.get("demo_sleep").and_then(Value::as_f64) else {
            return;
        };
        let scaled = seconds * global_config().demo_sleep_scale();
        if scaled > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(scaled)).await;
        }
    }
}

#[async_trait]
impl Executor for SystemInfoExecutor {
    fn id(&self) -> &str {
        Self::ID
    }

    fn type_name(&self) -> &str {
        "stdio"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "resource": {
                    "type": "string",
                    "enum": VALID_RESOURCES,
                    "description": "Which resource to report on"
                },
                "demo_sleep": {
                    "type": "number",
                    "description": "Artificial delay in seconds, scaled by the demo sleep scale"
                }
            }
        })
    }

    async fn execute(&self, inputs: &JsonMap) -> Result<ExecutorResult> {
        Self::demo_sleep(inputs).await;

        if self.cancellation.is_cancelled() {
            return Ok(ExecutorResult::cancelled("cancelled before gathering info"));
        }

        let resource = inputs
            .get("resource")
            .and_then(Value::as_str)
            .unwrap_or("all");

        let mut payload = match resource {
            "cpu" => Self::cpu_info(),
            "memory" => Self::memory_info(),
            "disk" => Self::disk_info(),
            "all" => {
                let mut all = Self::cpu_info();
                for (k, v) in Self::memory_info() {
                    all.entry(k).or_insert(v);
                }
                for (k, v) in Self::disk_info() {
                    all.entry(k).or_insert(v);
                }
                all
            }
            other => {
                return Ok(ExecutorResult::failed(format!(
                    "unknown resource {:?}: expected one of {}",
                    other,
                    VALID_RESOURCES.join(", ")
                )));
            }
        };
        payload.insert("resource".to_owned(), json!(resource));

        Ok(ExecutorResult::success(Value::Object(payload)))
    }
}
