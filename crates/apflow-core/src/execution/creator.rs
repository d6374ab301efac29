//! Task creator: validates a task-array spec, assigns ids, persists the
//! tree, and supports deep/shallow subtree copies for re-execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use uuid::Uuid;

use apflow_db::TaskRepository;
use apflow_db::models::{Task, TaskDependency, TaskSpec, TaskTreeNode};
use apflow_db::repository::dependency_cycle;

use crate::extensions::ExtensionRegistry;

/// Errors raised while validating a task-array spec.
#[derive(Debug, Error)]
pub enum TaskCreateError {
    #[error("task array must contain at least one task")]
    Empty,

    #[error("task array must contain exactly one root task, found {count}: {roots}")]
    MultipleRoots { count: usize, roots: String },

    #[error("task array has no root task (every task has a parent_id)")]
    NoRoot,

    #[error("task array mixes tasks with and without explicit ids")]
    MixedIdMode,

    #[error("duplicate task id {0:?} in array")]
    DuplicateId(String),

    #[error("task {task:?} references unknown parent {parent:?}")]
    UnknownParent { task: String, parent: String },

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("circular dependency detected involving tasks: {0}")]
    DependencyCycle(String),

    #[error("task {0:?} is not reachable from the root")]
    Unreachable(String),

    #[error("unknown executor {method:?} on task {task:?}")]
    UnknownExecutor { task: String, method: String },
}

/// Validates and persists task trees.
pub struct TaskCreator {
    repository: TaskRepository,
    registry: Option<Arc<ExtensionRegistry>>,
}

impl TaskCreator {
    pub fn new(repository: TaskRepository) -> Self {
        Self {
            repository,
            registry: None,
        }
    }

    /// Validate `schemas.method` values against an extension registry.
    pub fn with_registry(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate a task array and persist it as a tree.
    ///
    /// Rows are committed parents-first, depth-first; on failure the rows
    /// created so far are deleted (children before parents) and the error
    /// is returned.
    pub async fn create_task_tree(&self, specs: &[TaskSpec]) -> Result<TaskTreeNode> {
        self.validate(specs)?;

        // Assign ids where missing; references were validated against the
        // supplied ids, so generated ids never need rewriting.
        let specs: Vec<TaskSpec> = specs
            .iter()
            .cloned()
            .map(|mut spec| {
                if spec.id.is_none() {
                    spec.id = Some(Uuid::new_v4().to_string());
                }
                spec
            })
            .collect();

        let order = persistence_order(&specs);

        let mut created: Vec<Task> = Vec::with_capacity(order.len());
        for idx in order {
            let spec = &specs[idx];
            match self.repository.create_task(spec).await {
                Ok(task) => created.push(task),
                Err(e) => {
                    for task in created.iter().rev() {
                        if let Err(cleanup) = self.repository.delete_task(&task.id).await {
                            tracing::warn!(
                                task_id = %task.id,
                                error = %cleanup,
                                "failed to roll back task row after create failure"
                            );
                        }
                    }
                    return Err(e.context(format!("failed to persist task {:?}", spec.name)));
                }
            }
        }

        let root = created
            .first()
            .context("no rows created for a validated task array")?;
        tracing::info!(
            root_task_id = %root.id,
            task_count = created.len(),
            "created task tree"
        );
        assemble_tree(created)
    }

    /// Copy a task, or its whole subtree when `children` is true.
    ///
    /// The copy gets fresh ids, dependencies rewritten to the new ids
    /// (references leaving the copied subtree are dropped), `pending`
    /// status, zero progress, and cleared result/error/timestamps.
    pub async fn copy_task(&self, root: &Task, children: bool) -> Result<TaskTreeNode> {
        let mut originals = vec![root.clone()];
        if children {
            originals.extend(self.repository.children_recursive(&root.id).await?);
        }

        let id_map: HashMap<String, String> = originals
            .iter()
            .map(|t| (t.id.clone(), Uuid::new_v4().to_string()))
            .collect();

        let mut created: Vec<Task> = Vec::with_capacity(originals.len());
        for (i, original) in originals.iter().enumerate() {
            let new_parent = if i == 0 {
                // The copy becomes a new root.
                None
            } else {
                original
                    .parent_id
                    .as_ref()
                    .and_then(|p| id_map.get(p))
                    .cloned()
            };

            let dependencies: Vec<TaskDependency> = original
                .dependencies
                .iter()
                .filter_map(|dep| {
                    let new_id = id_map.get(dep.id())?;
                    Some(match dep {
                        TaskDependency::Id(_) => TaskDependency::Id(new_id.clone()),
                        TaskDependency::Spec { required, .. } => TaskDependency::Spec {
                            id: new_id.clone(),
                            required: *required,
                        },
                    })
                })
                .collect();

            let spec = TaskSpec {
                id: Some(id_map[&original.id].clone()),
                parent_id: new_parent,
                user_id: original.user_id.clone(),
                name: original.name.clone(),
                priority: original.priority,
                dependencies,
                inputs: original.inputs.clone(),
                params: original.params.clone(),
                schemas: original.schemas.clone(),
                extra: original.extra.clone(),
            };

            match self.repository.create_task(&spec).await {
                Ok(task) => created.push(task),
                Err(e) => {
                    for task in created.iter().rev() {
                        let _ = self.repository.delete_task(&task.id).await;
                    }
                    return Err(e.context(format!("failed to copy task {:?}", original.name)));
                }
            }
        }

        tracing::info!(
            source_task_id = %root.id,
            copy_task_id = %created[0].id,
            task_count = created.len(),
            "copied task tree"
        );
        assemble_tree(created)
    }

    /// Validate a task-array spec without persisting anything.
    pub fn validate(&self, specs: &[TaskSpec]) -> Result<(), TaskCreateError> {
        if specs.is_empty() {
            return Err(TaskCreateError::Empty);
        }

        // Mode consistency: all ids supplied, or none.
        let with_ids = specs.iter().filter(|s| s.id.is_some()).count();
        if with_ids != 0 && with_ids != specs.len() {
            return Err(TaskCreateError::MixedIdMode);
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for spec in specs {
            if let Some(id) = spec.id.as_deref() {
                if !ids.insert(id) {
                    return Err(TaskCreateError::DuplicateId(id.to_owned()));
                }
            }
        }

        // Exactly one root.
        let roots: Vec<&TaskSpec> = specs.iter().filter(|s| s.parent_id.is_none()).collect();
        if roots.is_empty() {
            return Err(TaskCreateError::NoRoot);
        }
        if roots.len() > 1 {
            let names: Vec<&str> = roots
                .iter()
                .map(|s| s.id.as_deref().unwrap_or(s.name.as_str()))
                .collect();
            return Err(TaskCreateError::MultipleRoots {
                count: roots.len(),
                roots: names.join(", "),
            });
        }

        // Parent and dependency references stay within the array.
        for spec in specs {
            if let Some(parent) = spec.parent_id.as_deref() {
                if !ids.contains(parent) {
                    return Err(TaskCreateError::UnknownParent {
                        task: spec.name.clone(),
                        parent: parent.to_owned(),
                    });
                }
            }
            for dep in &spec.dependencies {
                if !ids.contains(dep.id()) {
                    return Err(TaskCreateError::UnknownDependency {
                        task: spec.name.clone(),
                        dependency: dep.id().to_owned(),
                    });
                }
            }
        }

        // Every task reachable from the root through parent edges.
        if specs.len() > 1 {
            let root_id = roots[0].id.as_deref().expect("ids present for multi-task arrays");
            let mut children_of: HashMap<&str, Vec<&TaskSpec>> = HashMap::new();
            for spec in specs {
                if let Some(parent) = spec.parent_id.as_deref() {
                    children_of.entry(parent).or_default().push(spec);
                }
            }
            let mut reached: HashSet<&str> = HashSet::new();
            let mut queue: VecDeque<&str> = VecDeque::from([root_id]);
            while let Some(current) = queue.pop_front() {
                if !reached.insert(current) {
                    continue;
                }
                for child in children_of.get(current).into_iter().flatten() {
                    queue.push_back(child.id.as_deref().expect("ids present"));
                }
            }
            for spec in specs {
                let id = spec.id.as_deref().expect("ids present");
                if !reached.contains(id) {
                    return Err(TaskCreateError::Unreachable(spec.name.clone()));
                }
            }
        }

        // The dependency graph is acyclic.
        let edges: Vec<(String, Vec<String>)> = specs
            .iter()
            .map(|s| {
                (
                    s.id.clone().unwrap_or_else(|| s.name.clone()),
                    s.dependencies.iter().map(|d| d.id().to_owned()).collect(),
                )
            })
            .collect();
        if let Some(cycle) = dependency_cycle(&edges) {
            return Err(TaskCreateError::DependencyCycle(cycle.join(", ")));
        }

        // Executor ids resolve, when a registry is wired in.
        if let Some(registry) = &self.registry {
            for spec in specs {
                if let Some(method) = spec.executor_id() {
                    if !registry.has_executor(method) {
                        return Err(TaskCreateError::UnknownExecutor {
                            task: spec.name.clone(),
                            method: method.to_owned(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Indexes of `specs` in parents-first, depth-first persistence order.
fn persistence_order(specs: &[TaskSpec]) -> Vec<usize> {
    let index_of: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.id.as_deref().map(|id| (id, i)))
        .collect();
    let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut root = 0usize;
    for (i, spec) in specs.iter().enumerate() {
        match spec.parent_id.as_deref().and_then(|p| index_of.get(p)) {
            Some(&parent) => children_of.entry(parent).or_default().push(i),
            None => root = i,
        }
    }

    let mut order = Vec::with_capacity(specs.len());
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        order.push(current);
        if let Some(children) = children_of.get(&current) {
            for &child in children.iter().rev() {
                stack.push(child);
            }
        }
    }
    order
}

/// Assemble persisted rows (parents before children) into a tree node.
fn assemble_tree(tasks: Vec<Task>) -> Result<TaskTreeNode> {
    let root_id = tasks.first().context("empty task list")?.id.clone();
    let mut nodes: HashMap<String, TaskTreeNode> = tasks
        .iter()
        .map(|t| (t.id.clone(), TaskTreeNode::new(t.clone())))
        .collect();

    for task in tasks.iter().skip(1).rev() {
        let node = nodes.remove(&task.id).expect("node present");
        let parent_id = task.parent_id.as_deref().expect("non-root task has parent");
        if let Some(parent) = nodes.get_mut(parent_id) {
            parent.children.insert(0, node);
        }
    }

    nodes
        .remove(&root_id)
        .context("root node missing after tree assembly")
}
