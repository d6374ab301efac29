//! Dependency resolution: readiness checks and merging of completed
//! dependencies' results into a dependent task's inputs.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde_json::Value;

use apflow_db::TaskRepository;
use apflow_db::models::{JsonMap, Task, TaskStatus};

/// Completed tasks (with a result) in the same tree as `task`, keyed by id.
pub async fn completed_tasks_in_tree(
    task: &Task,
    repository: &TaskRepository,
) -> Result<HashMap<String, Task>> {
    let root = repository.root_of(task).await?;
    let all = repository.all_in_tree(&root).await?;
    Ok(all
        .into_iter()
        .filter(|t| t.status == TaskStatus::Completed && t.result.is_some())
        .map(|t| (t.id.clone(), t))
        .collect())
}

/// Check whether all dependencies of `task` are satisfied.
///
/// A dependency is satisfied when its referent in the same tree is
/// `completed` with a stored result. A completed referent satisfies its
/// dependents even while marked for re-execution: the stored result is
/// still authoritative. Non-required referents that are missing or
/// incomplete do not block. A task with no dependencies is satisfied.
pub async fn are_dependencies_satisfied(
    task: &Task,
    repository: &TaskRepository,
    to_reexecute: &HashSet<String>,
) -> Result<bool> {
    if task.dependencies.is_empty() {
        return Ok(true);
    }

    let completed = completed_tasks_in_tree(task, repository).await?;

    for dep in &task.dependencies {
        let dep_id = dep.id();
        if completed.contains_key(dep_id) {
            if to_reexecute.contains(dep_id) {
                tracing::debug!(
                    task_id = %task.id,
                    dependency = %dep_id,
                    "dependency marked for re-execution but completed result is available"
                );
            }
        } else if dep.required() {
            tracing::debug!(
                task_id = %task.id,
                dependency = %dep_id,
                "required dependency not completed with a result"
            );
            return Ok(false);
        }
    }

    Ok(true)
}

/// Merge completed dependencies' results into `task.inputs`.
///
/// For an object dependency reference:
/// - the payload is the dependency result's nested `result` field when that
///   is an object, otherwise the result itself;
/// - when the task declares `schemas.input_schema.properties`, every
///   property name present in the payload is copied in (dependency payloads
///   overwrite pre-existing inputs; with several dependencies surfacing the
///   same property, the task's dependency order decides -- last wins);
/// - otherwise the full result is stored under the dependency id.
///
/// A bare-string reference merges the whole result when it is an object,
/// otherwise stores it under the dependency id. Non-object results are
/// always stored under the dependency id.
pub async fn resolve_task_dependencies(
    task: &Task,
    repository: &TaskRepository,
) -> Result<JsonMap> {
    let mut inputs = task.inputs.clone();
    if task.dependencies.is_empty() {
        return Ok(inputs);
    }

    let completed = completed_tasks_in_tree(task, repository).await?;

    for dep in &task.dependencies {
        let dep_id = dep.id();
        let Some(source) = completed.get(dep_id) else {
            if dep.required() {
                tracing::warn!(
                    task_id = %task.id,
                    dependency = %dep_id,
                    "required dependency has no completed task to resolve from"
                );
            }
            continue;
        };
        let Some(source_result) = &source.result else {
            continue;
        };

        if dep.is_bare() {
            match source_result {
                Value::Object(map) => {
                    for (key, value) in map {
                        inputs.insert(key.clone(), value.clone());
                    }
                }
                other => {
                    inputs.insert(dep_id.to_owned(), other.clone());
                }
            }
            continue;
        }

        match source_result {
            Value::Object(result_map) => {
                let payload = match result_map.get("result") {
                    Some(Value::Object(nested)) => nested,
                    _ => result_map,
                };

                let schema_properties = task
                    .input_schema()
                    .and_then(|schema| schema.get("properties"))
                    .and_then(Value::as_object);

                match schema_properties {
                    Some(properties) => {
                        let mut mapped = 0usize;
                        for field in properties.keys() {
                            if let Some(value) = payload.get(field) {
                                inputs.insert(field.clone(), value.clone());
                                mapped += 1;
                            }
                        }
                        tracing::debug!(
                            task_id = %task.id,
                            dependency = %dep_id,
                            mapped,
                            "mapped dependency result fields through input schema"
                        );
                    }
                    None => {
                        inputs.insert(dep_id.to_owned(), source_result.clone());
                    }
                }
            }
            other => {
                inputs.insert(dep_id.to_owned(), other.clone());
            }
        }
    }

    Ok(inputs)
}
