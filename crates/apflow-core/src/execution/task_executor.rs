//! Task executor facade: the process front end transport adapters call.
//!
//! Accepts a task array (or loads an existing tree), hands it to a task
//! manager, tracks in-flight trees, serves as the cancellation entry
//! point, and fires the tree lifecycle hooks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use apflow_db::models::{StatusUpdate, Task, TaskSpec, TaskStatus, TaskTreeNode};
use apflow_db::{SessionPool, TaskRepository};

use crate::config::{ConfigRegistry, PostHook, PreHook, TreeHookKind};
use crate::execution::manager::{ManagerConfig, TaskManager};
use crate::extensions::ExtensionRegistry;
use crate::execution::creator::TaskCreator;
use crate::streaming::StreamingCallback;

/// Options for one [`TaskExecutor::execute_tasks`] call.
#[derive(Default)]
pub struct ExecuteOptions {
    /// Root task id, when the caller already knows it (required-existing
    /// mode with an array that does not mark the root).
    pub root_task_id: Option<String>,
    pub use_streaming: bool,
    pub streaming_callback: Option<Arc<dyn StreamingCallback>>,
    /// Per-call override of the config registry's `require_existing_tasks`.
    pub require_existing_tasks: Option<bool>,
    pub manager_config: ManagerConfig,
}

/// Result of a tree execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: TaskStatus,
    pub root_task_id: String,
    pub progress: f64,
}

/// Result of a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub status: TaskStatus,
    pub message: String,
    pub token_usage: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

struct ConfigSnapshot {
    pre_hooks: Vec<PreHook>,
    post_hooks: Vec<PostHook>,
    use_task_creator: bool,
    require_existing_tasks: bool,
}

/// The facade. One instance per process; transports share it.
pub struct TaskExecutor {
    sessions: SessionPool,
    registry: Arc<ExtensionRegistry>,
    config: Arc<ConfigRegistry>,
    snapshot: RwLock<ConfigSnapshot>,
    running: RwLock<HashMap<String, CancellationToken>>,
}

impl TaskExecutor {
    pub fn new(
        sessions: SessionPool,
        registry: Arc<ExtensionRegistry>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        let snapshot = Self::snapshot_of(&config);
        Self {
            sessions,
            registry,
            config,
            snapshot: RwLock::new(snapshot),
            running: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot_of(config: &ConfigRegistry) -> ConfigSnapshot {
        ConfigSnapshot {
            pre_hooks: config.pre_hooks(),
            post_hooks: config.post_hooks(),
            use_task_creator: config.use_task_creator(),
            require_existing_tasks: config.require_existing_tasks(),
        }
    }

    /// Re-read hooks and flags from the config registry, so registrations
    /// made after this instance was built take effect. Idempotent.
    pub fn refresh_config(&self) {
        *self.snapshot.write().expect("snapshot lock poisoned") = Self::snapshot_of(&self.config);
    }

    fn repository(&self) -> TaskRepository {
        TaskRepository::new(
            self.sessions.database().clone(),
            self.config.task_schema(),
        )
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a task array: materialize it (or load existing rows), run
    /// the tree to a terminal state, and report the rolled-up outcome.
    pub async fn execute_tasks(
        &self,
        specs: Vec<TaskSpec>,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        // One session per concurrent tree execution; released on return.
        let _session = self.sessions.acquire()?;
        let repository = self.repository();

        let (require_existing, use_creator) = {
            let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
            (
                options
                    .require_existing_tasks
                    .unwrap_or(snapshot.require_existing_tasks),
                snapshot.use_task_creator,
            )
        };

        let (node, to_reexecute) = if require_existing {
            self.load_existing_tree(&repository, &specs, options.root_task_id.as_deref())
                .await?
        } else {
            let node = if use_creator {
                let creator =
                    TaskCreator::new(repository.clone()).with_registry(Arc::clone(&self.registry));
                creator.create_task_tree(&specs).await?
            } else {
                self.quick_create(&repository, &specs).await?
            };
            self.fire_tree_hooks(TreeHookKind::Created, &node.task).await;
            (node, HashSet::new())
        };

        self.execute_task_tree(node, repository, to_reexecute, options)
            .await
    }

    /// Lower-level entry: run an already-materialized tree.
    pub async fn execute_task_tree(
        &self,
        node: TaskTreeNode,
        repository: TaskRepository,
        to_reexecute: HashSet<String>,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let root_id = node.task.id.clone();
        let token = CancellationToken::new();
        self.running
            .write()
            .expect("running table lock poisoned")
            .insert(root_id.clone(), token.clone());

        self.fire_tree_hooks(TreeHookKind::Started, &node.task).await;

        let (pre_hooks, post_hooks) = {
            let snapshot = self.snapshot.read().expect("snapshot lock poisoned");
            (snapshot.pre_hooks.clone(), snapshot.post_hooks.clone())
        };

        let mut manager = TaskManager::new(repository.clone(), Arc::clone(&self.registry))
            .with_config(options.manager_config.clone())
            .with_cancellation(token)
            .with_hooks(pre_hooks, post_hooks)
            .with_reexecute(to_reexecute);
        if options.use_streaming {
            if let Some(callback) = options.streaming_callback.clone() {
                manager = manager.with_streaming(callback);
            }
        }

        let run_result = manager.run(&root_id).await;

        self.running
            .write()
            .expect("running table lock poisoned")
            .remove(&root_id);

        match run_result {
            Ok(outcome) => {
                let kind = if outcome.status == TaskStatus::Completed {
                    TreeHookKind::Completed
                } else {
                    TreeHookKind::Failed
                };
                self.fire_tree_hooks(kind, &outcome.root).await;
                Ok(ExecutionOutcome {
                    status: outcome.status,
                    root_task_id: root_id,
                    progress: outcome.progress,
                })
            }
            Err(e) => {
                if let Ok(Some(root)) = repository.get_task(&root_id).await {
                    self.fire_tree_hooks(TreeHookKind::Failed, &root).await;
                }
                Err(e)
            }
        }
    }

    async fn load_existing_tree(
        &self,
        repository: &TaskRepository,
        specs: &[TaskSpec],
        root_task_id: Option<&str>,
    ) -> Result<(TaskTreeNode, HashSet<String>)> {
        let root_id = match root_task_id {
            Some(id) => id.to_owned(),
            None => specs
                .iter()
                .find(|s| s.parent_id.is_none())
                .and_then(|s| s.id.clone())
                .context("require_existing_tasks is set but no root task id was supplied")?,
        };

        for spec in specs {
            let Some(id) = spec.id.as_deref() else {
                bail!("require_existing_tasks is set but task {:?} carries no id", spec.name);
            };
            if repository.get_task(id).await?.is_none() {
                bail!("task {id:?} does not exist and require_existing_tasks is set");
            }
        }

        let root = repository
            .get_task(&root_id)
            .await?
            .with_context(|| format!("root task {root_id:?} does not exist"))?;
        let node = repository.build_tree(&root).await?;

        // Pending rows that already carry a result were completed before;
        // the caller re-marked them for another run.
        let to_reexecute: HashSet<String> = node
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.result.is_some())
            .map(|t| t.id.clone())
            .collect();

        Ok((node, to_reexecute))
    }

    /// Raw creation path used when the task creator is disabled: rows are
    /// inserted in array order with no validation.
    async fn quick_create(
        &self,
        repository: &TaskRepository,
        specs: &[TaskSpec],
    ) -> Result<TaskTreeNode> {
        let mut root: Option<Task> = None;
        for spec in specs {
            let task = repository.create_task(spec).await?;
            if task.parent_id.is_none() && root.is_none() {
                root = Some(task);
            }
        }
        let root = root.context("task array has no root task")?;
        repository.build_tree(&root).await
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Signal cancellation for the tree containing `task_id`.
    ///
    /// Sets the tree's cancellation flag (observed by its manager before
    /// any further dispatch), writes `cancelled` on the target task and its
    /// non-terminal descendants, and reports any partial result and token
    /// usage already stored. Safe to call repeatedly and on terminal tasks.
    pub async fn cancel_task(
        &self,
        task_id: &str,
        error_message: Option<&str>,
    ) -> Result<CancelOutcome> {
        let repository = self.repository();
        let task = repository
            .get_task(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;
        let root = repository.root_of(&task).await?;

        // Flag first: no further frontier dispatch once this is set.
        let flagged = {
            let running = self.running.read().expect("running table lock poisoned");
            match running.get(&root.id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        };

        let token_usage = task
            .result
            .as_ref()
            .and_then(|r| r.get("token_usage"))
            .cloned();

        if task.status.is_terminal() {
            return Ok(CancelOutcome {
                status: task.status,
                message: format!(
                    "task {} is already {}; nothing to cancel",
                    task_id, task.status
                ),
                token_usage,
                result: task.result.clone(),
                error: task.error.clone(),
            });
        }

        let message = error_message
            .map(str::to_owned)
            .unwrap_or_else(|| "task cancelled".to_owned());

        let mut targets = vec![task.clone()];
        targets.extend(repository.children_recursive(task_id).await?);
        for target in &targets {
            if target.status.is_terminal() {
                continue;
            }
            repository
                .update_status(
                    &target.id,
                    TaskStatus::Cancelled,
                    StatusUpdate {
                        error: Some(message.clone()),
                        progress: Some(1.0),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        tracing::info!(
            task_id = %task_id,
            root_task_id = %root.id,
            flagged_running_tree = flagged,
            "task cancelled"
        );

        Ok(CancelOutcome {
            status: TaskStatus::Cancelled,
            message: message.clone(),
            token_usage,
            result: task.result.clone(),
            error: Some(message),
        })
    }

    // -----------------------------------------------------------------------
    // In-flight views
    // -----------------------------------------------------------------------

    /// True when `task_id` is the root of a tree currently executing in
    /// this process.
    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.running
            .read()
            .expect("running table lock poisoned")
            .contains_key(task_id)
    }

    /// Root ids of all trees currently executing in this process.
    pub fn get_all_running_tasks(&self) -> Vec<String> {
        self.running
            .read()
            .expect("running table lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_running_tasks_count(&self) -> usize {
        self.running
            .read()
            .expect("running table lock poisoned")
            .len()
    }

    // -----------------------------------------------------------------------
    // Tree lifecycle hooks
    // -----------------------------------------------------------------------

    async fn fire_tree_hooks(&self, kind: TreeHookKind, root: &Task) {
        for hook in self.config.tree_hooks(kind) {
            if let Err(e) = hook(root).await {
                tracing::warn!(hook = %kind, root_task_id = %root.id, error = %e, "tree hook failed");
            }
        }
    }
}

static GLOBAL: OnceLock<Arc<TaskExecutor>> = OnceLock::new();

/// Install the process-wide facade. Returns the installed instance; later
/// calls return the existing one.
pub fn init_global_executor(
    sessions: SessionPool,
    registry: Arc<ExtensionRegistry>,
    config: Arc<ConfigRegistry>,
) -> Arc<TaskExecutor> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(TaskExecutor::new(sessions, registry, config))))
}

/// The process-wide facade, when one has been installed.
pub fn global_executor() -> Option<Arc<TaskExecutor>> {
    GLOBAL.get().cloned()
}
