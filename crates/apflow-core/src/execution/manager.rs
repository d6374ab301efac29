//! Per-tree scheduling loop: frontier collection, dependency gating,
//! executor dispatch, pre/post hooks, status/progress roll-up, cancellation
//! honoring, and streaming callbacks.
//!
//! One manager instance handles one tree end-to-end. Frontier tasks are
//! spawned concurrently, bounded by a semaphore (`max_concurrency`); their
//! results come back over a channel and join at the sweep boundary, and
//! ancestors are rolled up after each completion.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use apflow_db::TaskRepository;
use apflow_db::models::{StatusUpdate, Task, TaskStatus, TaskTreeNode};

use crate::config::{PostHook, PreHook};
use crate::execution::resolver;
use crate::execution::tree::{round_progress, rolled_up_progress, rolled_up_status};
use crate::extensions::{ExecutionStatus, ExecutorInit, ExecutorResult, ExtensionRegistry};
use crate::streaming::{StreamingCallback, TaskStreamEvent};

/// Tunables for one manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of frontier tasks running concurrently.
    pub max_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

/// The per-tree scheduler.
#[derive(Clone)]
pub struct TaskManager {
    repository: TaskRepository,
    registry: Arc<ExtensionRegistry>,
    config: ManagerConfig,
    cancellation: CancellationToken,
    pre_hooks: Vec<PreHook>,
    post_hooks: Vec<PostHook>,
    streaming: Option<Arc<dyn StreamingCallback>>,
    to_reexecute: HashSet<String>,
}

impl TaskManager {
    pub fn new(repository: TaskRepository, registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            repository,
            registry,
            config: ManagerConfig::default(),
            cancellation: CancellationToken::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            streaming: None,
            to_reexecute: HashSet::new(),
        }
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a cancellation token owned by the caller (the facade keys one
    /// per running root).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_hooks(mut self, pre: Vec<PreHook>, post: Vec<PostHook>) -> Self {
        self.pre_hooks = pre;
        self.post_hooks = post;
        self
    }

    pub fn with_streaming(mut self, callback: Arc<dyn StreamingCallback>) -> Self {
        self.streaming = Some(callback);
        self
    }

    /// Ids the caller has re-marked `pending` for re-execution.
    pub fn with_reexecute(mut self, ids: HashSet<String>) -> Self {
        self.to_reexecute = ids;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run the tree rooted at `root_id` until it is terminal or cancelled.
    ///
    /// Returns the root task row together with the computed (rolled-up)
    /// status and progress of the whole tree.
    pub async fn run(&self, root_id: &str) -> Result<TreeOutcome> {
        loop {
            let root = self
                .repository
                .get_task(root_id)
                .await?
                .with_context(|| format!("root task {root_id} not found"))?;
            let tree = self.repository.build_tree(&root).await?;

            if self.cancellation.is_cancelled() {
                tracing::info!(root_task_id = %root_id, "cancellation observed, cancelling remaining tasks");
                self.cancel_remaining(&tree).await?;
                return self.outcome(root_id).await;
            }

            let computed = computed_status(&tree);
            if computed.is_terminal() {
                self.persist_rollups(&tree).await?;
                tracing::info!(
                    root_task_id = %root_id,
                    status = %computed,
                    "task tree reached terminal status"
                );
                return self.outcome(root_id).await;
            }

            let frontier = self.collect_frontier(&tree).await?;
            if frontier.is_empty() {
                tracing::warn!(
                    root_task_id = %root_id,
                    "no dispatchable tasks and tree is not terminal, stopping sweep loop"
                );
                self.persist_rollups(&tree).await?;
                return self.outcome(root_id).await;
            }

            tracing::debug!(
                root_task_id = %root_id,
                frontier = frontier.len(),
                "dispatching frontier"
            );

            // Spawn the frontier, bounded by the semaphore; results come
            // back over the channel and join at the sweep boundary.
            // Ancestors roll up as each task finishes.
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
            let (tx, mut rx) = mpsc::channel::<Result<String>>(frontier.len());
            for task in frontier {
                let permit = semaphore.clone().acquire_owned().await?;
                let manager = self.clone();
                let context_id = root_id.to_owned();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = manager.execute_single(task, &context_id).await;
                    drop(permit);
                    let _ = tx.send(result).await;
                });
            }
            drop(tx);

            let mut dispatch_err: Option<anyhow::Error> = None;
            while let Some(finished) = rx.recv().await {
                match finished {
                    Ok(task_id) => self.roll_up_ancestors(&task_id, root_id).await?,
                    Err(e) => {
                        if dispatch_err.is_none() {
                            dispatch_err = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = dispatch_err {
                return Err(e);
            }
        }
    }

    /// Pending tasks with an executor binding whose dependencies are
    /// satisfied. Tasks without a `schemas.method` are containers: they are
    /// never dispatched, their state comes from roll-up.
    async fn collect_frontier(&self, tree: &TaskTreeNode) -> Result<Vec<Task>> {
        let mut frontier = Vec::new();
        for task in tree.iter() {
            if task.status != TaskStatus::Pending || task.executor_id().is_none() {
                continue;
            }
            if resolver::are_dependencies_satisfied(task, &self.repository, &self.to_reexecute)
                .await?
            {
                frontier.push(task.clone());
            }
        }
        Ok(frontier)
    }

    /// Run one task through dependency resolution, hooks, and its executor.
    /// Always resolves to the task id; failures are recorded on the row.
    async fn execute_single(&self, mut task: Task, context_id: &str) -> Result<String> {
        let task_id = task.id.clone();

        // Once the flag is set no further frontier tasks start.
        if self.cancellation.is_cancelled() {
            self.repository
                .update_status(
                    &task_id,
                    TaskStatus::Cancelled,
                    StatusUpdate {
                        error: Some("task cancelled before dispatch".to_owned()),
                        progress: Some(1.0),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.emit_row_event(&task_id, context_id, true).await?;
            return Ok(task_id);
        }

        self.repository
            .update_status(
                &task_id,
                TaskStatus::InProgress,
                StatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        task.status = TaskStatus::InProgress;
        self.emit_row_event(&task_id, context_id, false).await?;

        // Merge completed dependencies' results into the inputs, then let
        // pre-hooks adjust them; the executor sees the final map.
        task.inputs = resolver::resolve_task_dependencies(&task, &self.repository).await?;
        for hook in &self.pre_hooks {
            if let Err(e) = hook(&mut task).await {
                tracing::warn!(task_id = %task_id, error = %e, "pre-hook failed");
            }
        }
        self.repository.update_inputs(&task_id, &task.inputs).await?;

        let exec_result = self.run_executor(&task).await;
        let exec_result = match exec_result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "executor failed");
                ExecutorResult::failed(e.to_string())
            }
        };

        // A non-cancelable executor may finish after the flag was set; the
        // row still ends cancelled, keeping whatever it produced.
        let exec_result = if self.cancellation.is_cancelled()
            && exec_result.status != ExecutionStatus::Cancelled
        {
            ExecutorResult {
                status: ExecutionStatus::Cancelled,
                error: Some("task cancelled during execution".to_owned()),
                ..exec_result
            }
        } else {
            exec_result
        };

        let stored_result = serde_json::to_value(&exec_result)?;
        let (status, error) = match exec_result.status {
            ExecutionStatus::Success | ExecutionStatus::Completed => (TaskStatus::Completed, None),
            ExecutionStatus::Failed => (
                TaskStatus::Failed,
                Some(
                    exec_result
                        .error
                        .clone()
                        .unwrap_or_else(|| "executor reported failure".to_owned()),
                ),
            ),
            ExecutionStatus::Cancelled => (
                TaskStatus::Cancelled,
                Some(
                    exec_result
                        .error
                        .clone()
                        .unwrap_or_else(|| "task cancelled".to_owned()),
                ),
            ),
        };

        self.repository
            .update_status(
                &task_id,
                status,
                StatusUpdate {
                    error,
                    result: Some(stored_result.clone()),
                    progress: Some(1.0),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if status == TaskStatus::Completed {
            for hook in &self.post_hooks {
                if let Err(e) = hook(&task, &task.inputs, &stored_result).await {
                    tracing::warn!(task_id = %task_id, error = %e, "post-hook failed");
                }
            }
        }

        tracing::info!(task_id = %task_id, status = %status, "task finished");
        self.emit_row_event(&task_id, context_id, true).await?;
        Ok(task_id)
    }

    /// Instantiate and invoke the executor for a task. A cancelable
    /// executor races against the cancellation token and is asked to
    /// `cancel()` when the token fires first.
    async fn run_executor(&self, task: &Task) -> Result<ExecutorResult> {
        let method = task
            .executor_id()
            .context("task has no schemas.method executor binding")?;

        let init = ExecutorInit::new(task.inputs.clone(), task.params.clone())
            .with_cancellation(self.cancellation.child_token());
        let executor = self
            .registry
            .create_executor_instance(method, init)
            .with_context(|| format!("unknown executor {method:?}"))?;

        if executor.cancelable() {
            tokio::select! {
                result = executor.execute(&task.inputs) => result,
                _ = self.cancellation.cancelled() => Ok(executor.cancel().await),
            }
        } else {
            executor.execute(&task.inputs).await
        }
    }

    /// Transition every non-terminal task in the tree to `cancelled`,
    /// preserving any result already stored, then emit final events.
    async fn cancel_remaining(&self, tree: &TaskTreeNode) -> Result<()> {
        let root_id = &tree.task.id;
        for task in tree.iter() {
            if task.status.is_terminal() {
                continue;
            }
            self.repository
                .update_status(
                    &task.id,
                    TaskStatus::Cancelled,
                    StatusUpdate {
                        error: Some("task cancelled".to_owned()),
                        progress: Some(1.0),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.emit_row_event(&task.id, root_id, true).await?;
        }
        Ok(())
    }

    /// Walk ancestors of a finished task, persisting rolled-up progress and
    /// status on container rows and emitting events for observed changes.
    /// Rows that executed on their own keep their executor-written status.
    async fn roll_up_ancestors(&self, task_id: &str, root_id: &str) -> Result<()> {
        let Some(task) = self.repository.get_task(task_id).await? else {
            return Ok(());
        };
        let mut parent_id = task.parent_id.clone();

        while let Some(current_id) = parent_id {
            let Some(parent) = self.repository.get_task(&current_id).await? else {
                break;
            };
            let subtree = self.repository.build_tree(&parent).await?;
            self.persist_node_rollup(&subtree, root_id).await?;
            parent_id = parent.parent_id;
        }
        Ok(())
    }

    /// Persist roll-ups for every container node in the tree, children
    /// before parents.
    async fn persist_rollups(&self, tree: &TaskTreeNode) -> Result<()> {
        let mut stack = vec![tree];
        let mut order: Vec<&TaskTreeNode> = Vec::new();
        while let Some(node) = stack.pop() {
            order.push(node);
            for child in &node.children {
                stack.push(child);
            }
        }
        for node in order.iter().rev() {
            if !node.children.is_empty() {
                self.persist_node_rollup(node, &tree.task.id).await?;
            }
        }
        Ok(())
    }

    async fn persist_node_rollup(&self, node: &TaskTreeNode, context_id: &str) -> Result<()> {
        if node.children.is_empty() {
            return Ok(());
        }
        let progress = rolled_up_progress(node);
        let changed_progress = (node.task.progress - progress).abs() > f64::EPSILON;

        // A node that executes through its own method owns its row status;
        // only pure containers take the rolled-up status.
        if node.task.executor_id().is_none() {
            let status = rolled_up_status(node);
            if status == node.task.status && !changed_progress {
                return Ok(());
            }
            let started_at = if status == TaskStatus::InProgress && node.task.started_at.is_none() {
                Some(Utc::now())
            } else {
                None
            };
            let completed_at = if status.is_terminal() && node.task.completed_at.is_none() {
                Some(Utc::now())
            } else {
                None
            };
            self.repository
                .update_status(
                    &node.task.id,
                    status,
                    StatusUpdate {
                        progress: Some(progress),
                        started_at,
                        completed_at,
                        ..Default::default()
                    },
                )
                .await?;
            self.emit_row_event(&node.task.id, context_id, status.is_terminal())
                .await?;
        } else if changed_progress {
            self.repository
                .update_status(
                    &node.task.id,
                    node.task.status,
                    StatusUpdate {
                        progress: Some(progress),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn outcome(&self, root_id: &str) -> Result<TreeOutcome> {
        let root = self
            .repository
            .get_task(root_id)
            .await?
            .with_context(|| format!("root task {root_id} not found"))?;
        let tree = self.repository.build_tree(&root).await?;
        Ok(TreeOutcome {
            status: computed_status(&tree),
            progress: computed_progress(&tree),
            root,
        })
    }

    /// Emit a streaming event from the task's current row state.
    async fn emit_row_event(&self, task_id: &str, context_id: &str, final_: bool) -> Result<()> {
        let Some(callback) = &self.streaming else {
            return Ok(());
        };
        let Some(task) = self.repository.get_task(task_id).await? else {
            return Ok(());
        };

        let token_usage = task
            .result
            .as_ref()
            .and_then(|r| r.get("token_usage"))
            .cloned();
        let result = if final_ && task.status == TaskStatus::Completed {
            task.result.clone()
        } else {
            None
        };
        let error = if task.status == TaskStatus::Failed || task.status == TaskStatus::Cancelled {
            task.error.clone()
        } else {
            None
        };

        callback
            .on_event(TaskStreamEvent {
                task_id: task.id.clone(),
                context_id: context_id.to_owned(),
                status: task.status,
                progress: task.progress,
                result,
                error,
                token_usage,
                timestamp: Utc::now(),
                final_,
            })
            .await;
        Ok(())
    }
}

/// Final state of a tree run: the root row plus the computed tree status
/// and progress.
#[derive(Debug, Clone)]
pub struct TreeOutcome {
    pub root: Task,
    pub status: TaskStatus,
    pub progress: f64,
}

/// Computed status of a node. Containers take the precedence-max of their
/// children; a node that also executes contributes its own row status.
pub fn computed_status(node: &TaskTreeNode) -> TaskStatus {
    if node.children.is_empty() {
        return node.task.status;
    }
    let mut best = node
        .children
        .iter()
        .map(computed_status)
        .max_by_key(|s| s.precedence())
        .expect("non-empty children");
    if node.task.executor_id().is_some() && node.task.status.precedence() > best.precedence() {
        best = node.task.status;
    }
    best
}

/// Computed progress of a node: the mean of its children's computed
/// progresses (leaves report their own).
pub fn computed_progress(node: &TaskTreeNode) -> f64 {
    if node.children.is_empty() {
        return node.task.progress;
    }
    let sum: f64 = node.children.iter().map(computed_progress).sum();
    round_progress(sum / node.children.len() as f64)
}
