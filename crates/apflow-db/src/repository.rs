//! Task repository -- all database operations over the task table.
//!
//! The repository is parameterized by a runtime [`TaskTableSchema`] so that
//! user-defined columns participate in inserts, decoding, and ordering.
//! Every mutator commits on success; readers always fetch fresh rows so
//! concurrent writers' changes are visible.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{
    JsonMap, StatusUpdate, Task, TaskDependency, TaskQuery, TaskSpec, TaskStatus, TaskTreeNode,
};
use crate::schema::{ColumnDef, ColumnType, TaskTableSchema};

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>;

/// Repository over the task table.
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
    schema: Arc<TaskTableSchema>,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool, schema: Arc<TaskTableSchema>) -> Self {
        Self { pool, schema }
    }

    /// Repository over the default table with no user columns.
    pub fn with_default_schema(pool: SqlitePool) -> Self {
        Self::new(pool, Arc::new(TaskTableSchema::default()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> &TaskTableSchema {
        &self.schema
    }

    fn table(&self) -> &str {
        self.schema.table()
    }

    // -----------------------------------------------------------------------
    // Row mapping
    // -----------------------------------------------------------------------

    fn task_from_row(&self, row: &SqliteRow) -> Result<Task> {
        let dependencies: Vec<TaskDependency> =
            serde_json::from_str(&row.try_get::<String, _>("dependencies")?)
                .context("failed to decode dependencies column")?;
        let inputs: JsonMap = serde_json::from_str(&row.try_get::<String, _>("inputs")?)
            .context("failed to decode inputs column")?;
        let params: JsonMap = serde_json::from_str(&row.try_get::<String, _>("params")?)
            .context("failed to decode params column")?;
        let schemas: JsonMap = serde_json::from_str(&row.try_get::<String, _>("schemas")?)
            .context("failed to decode schemas column")?;
        let result: Option<Value> = match row.try_get::<Option<String>, _>("result")? {
            Some(s) => Some(serde_json::from_str(&s).context("failed to decode result column")?),
            None => None,
        };

        let mut extra = JsonMap::new();
        for col in self.schema.extra_columns() {
            let name = col.name.as_str();
            let value = match col.ty {
                ColumnType::Text => row
                    .try_get::<Option<String>, _>(name)?
                    .map(Value::String),
                ColumnType::Integer => row.try_get::<Option<i64>, _>(name)?.map(Value::from),
                ColumnType::Real => row.try_get::<Option<f64>, _>(name)?.map(Value::from),
                ColumnType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
                ColumnType::Json => match row.try_get::<Option<String>, _>(name)? {
                    Some(s) => Some(
                        serde_json::from_str(&s)
                            .with_context(|| format!("failed to decode json column {name}"))?,
                    ),
                    None => None,
                },
            };
            if let Some(v) = value {
                extra.insert(col.name.clone(), v);
            }
        }

        Ok(Task {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            dependencies,
            inputs,
            params,
            schemas,
            result,
            error: row.try_get("error")?,
            progress: row.try_get("progress")?,
            has_children: row.try_get("has_children")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            extra,
        })
    }

    fn bind_extra<'q>(q: SqliteQuery<'q>, def: &ColumnDef, value: &Value) -> SqliteQuery<'q> {
        match def.ty {
            ColumnType::Text => match value {
                Value::String(s) => q.bind(Some(s.clone())),
                Value::Null => q.bind(None::<String>),
                other => q.bind(Some(other.to_string())),
            },
            ColumnType::Integer => q.bind(value.as_i64()),
            ColumnType::Real => q.bind(value.as_f64()),
            ColumnType::Boolean => q.bind(value.as_bool()),
            ColumnType::Json => match value {
                Value::Null => q.bind(None::<String>),
                other => q.bind(serde_json::to_string(other).ok()),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Insert a new task row in `pending` status with progress 0.
    ///
    /// An id is generated when the spec carries none. Extra fields that do
    /// not match a declared user column are ignored with a warning, as is a
    /// `status` supplied through the extra map (new tasks always start
    /// `pending`). The parent's `has_children` flag is flipped when a
    /// `parent_id` is set.
    pub async fn create_task(&self, spec: &TaskSpec) -> Result<Task> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let mut extra_vals: Vec<(&ColumnDef, &Value)> = Vec::new();
        for (key, value) in &spec.extra {
            if key == "status" {
                tracing::debug!(task_id = %id, "ignoring status from extra fields; new tasks start pending");
                continue;
            }
            match self.schema.extra_column(key) {
                Some(def) => extra_vals.push((def, value)),
                None => tracing::warn!(
                    field = %key,
                    table = self.table(),
                    "custom field ignored: not declared on the task table schema"
                ),
            }
        }

        let mut columns: Vec<&str> = vec![
            "id",
            "parent_id",
            "user_id",
            "name",
            "status",
            "priority",
            "dependencies",
            "inputs",
            "params",
            "schemas",
            "progress",
            "has_children",
            "created_at",
            "updated_at",
        ];
        for (def, _) in &extra_vals {
            columns.push(def.name.as_str());
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(),
            columns.join(", "),
            placeholders
        );

        let mut q = sqlx::query(&sql)
            .bind(&id)
            .bind(&spec.parent_id)
            .bind(&spec.user_id)
            .bind(&spec.name)
            .bind(TaskStatus::Pending)
            .bind(spec.priority)
            .bind(serde_json::to_string(&spec.dependencies)?)
            .bind(serde_json::to_string(&spec.inputs)?)
            .bind(serde_json::to_string(&spec.params)?)
            .bind(serde_json::to_string(&spec.schemas)?)
            .bind(0.0_f64)
            .bind(false)
            .bind(now)
            .bind(now);
        for (def, value) in &extra_vals {
            q = Self::bind_extra(q, def, value);
        }
        q.execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert task {id:?}"))?;

        if let Some(parent_id) = &spec.parent_id {
            sqlx::query(&format!(
                "UPDATE {} SET has_children = 1, updated_at = ? WHERE id = ?",
                self.table()
            ))
            .bind(now)
            .bind(parent_id)
            .execute(&self.pool)
            .await
            .context("failed to update parent has_children flag")?;
        }

        self.get_task(&id)
            .await?
            .context("task row missing after insert")
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Fetch a single task by id.
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", self.table()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch task")?;
        row.map(|r| self.task_from_row(&r)).transpose()
    }

    /// Child tasks of a parent, ordered by priority ascending (creation
    /// time breaks ties).
    pub async fn children_of(&self, parent_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE parent_id = ? ORDER BY priority ASC, created_at ASC",
            self.table()
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch child tasks")?;
        rows.iter().map(|r| self.task_from_row(r)).collect()
    }

    /// Walk parent pointers up to the root of the tree.
    pub async fn root_of(&self, task: &Task) -> Result<Task> {
        let mut current = task.clone();
        let mut visited: HashSet<String> = HashSet::from([current.id.clone()]);
        while let Some(parent_id) = current.parent_id.clone() {
            if !visited.insert(parent_id.clone()) {
                bail!("parent cycle detected while resolving root of task {}", task.id);
            }
            match self.get_task(&parent_id).await? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(current)
    }

    /// All tasks in the subtree rooted at `root`, breadth-first, children
    /// in priority order.
    pub async fn all_in_tree(&self, root: &Task) -> Result<Vec<Task>> {
        let mut tasks = vec![root.clone()];
        let mut queue: VecDeque<String> = VecDeque::from([root.id.clone()]);
        while let Some(id) = queue.pop_front() {
            for child in self.children_of(&id).await? {
                queue.push_back(child.id.clone());
                tasks.push(child);
            }
        }
        Ok(tasks)
    }

    /// Build the in-memory tree view for the subtree rooted at `task`.
    pub async fn build_tree(&self, task: &Task) -> Result<TaskTreeNode> {
        let tasks = self.all_in_tree(task).await?;
        let mut nodes: HashMap<String, TaskTreeNode> = tasks
            .iter()
            .map(|t| (t.id.clone(), TaskTreeNode::new(t.clone())))
            .collect();

        // Attach children to parents in reverse breadth order so every
        // subtree is complete before it is attached.
        for t in tasks.iter().skip(1).rev() {
            let node = nodes.remove(&t.id).expect("node present");
            let parent_id = t.parent_id.as_deref().expect("non-root task has parent");
            if let Some(parent) = nodes.get_mut(parent_id) {
                parent.children.insert(0, node);
            }
        }

        nodes
            .remove(&task.id)
            .context("root node missing after tree assembly")
    }

    /// All descendants of a task (children, grandchildren, ...).
    pub async fn children_recursive(&self, id: &str) -> Result<Vec<Task>> {
        let mut out = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([id.to_owned()]);
        while let Some(current) = queue.pop_front() {
            for child in self.children_of(&current).await? {
                queue.push_back(child.id.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Completed tasks among `ids`, keyed by id.
    pub async fn completed_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Task>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM {} WHERE id IN ({placeholders}) AND status = 'completed'",
            self.table()
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch completed tasks by ids")?;
        rows.iter()
            .map(|r| self.task_from_row(r).map(|t| (t.id.clone(), t)))
            .collect()
    }

    /// Query tasks with filters, ordering, and pagination.
    pub async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let mut clauses: Vec<&str> = Vec::new();
        if query.user_id.is_some() {
            clauses.push("user_id = ?");
        }
        if query.status.is_some() {
            clauses.push("status = ?");
        }
        match query.parent_id.as_deref() {
            Some("") => clauses.push("parent_id IS NULL"),
            Some(_) => clauses.push("parent_id = ?"),
            None => {}
        }

        let order_by = if self.schema.has_column(&query.order_by) {
            query.order_by.as_str()
        } else {
            tracing::warn!(
                order_by = %query.order_by,
                "unknown order_by column, falling back to created_at"
            );
            "created_at"
        };
        let direction = if query.order_desc { "DESC" } else { "ASC" };

        let mut sql = format!("SELECT * FROM {}", self.table());
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {order_by} {direction} LIMIT ? OFFSET ?"));

        let mut q = sqlx::query(&sql);
        if let Some(user_id) = &query.user_id {
            q = q.bind(user_id);
        }
        if let Some(status) = query.status {
            q = q.bind(status);
        }
        if let Some(parent_id) = query.parent_id.as_deref() {
            if !parent_id.is_empty() {
                q = q.bind(parent_id.to_owned());
            }
        }
        q = q.bind(query.limit).bind(query.offset);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("failed to query tasks")?;
        rows.iter().map(|r| self.task_from_row(r)).collect()
    }

    /// Tasks anywhere in the store whose dependencies reference `id`.
    pub async fn find_dependents(&self, id: &str) -> Result<Vec<Task>> {
        let pattern = format!("%\"{id}\"%");
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE dependencies LIKE ?",
            self.table()
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .context("failed to scan for dependent tasks")?;

        let mut dependents = Vec::new();
        for row in &rows {
            let task = self.task_from_row(row)?;
            if task.dependencies.iter().any(|d| d.id() == id) {
                dependents.push(task);
            }
        }
        Ok(dependents)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Update a task's status and any accompanying fields.
    ///
    /// When no error is supplied and the new status is `completed`, the
    /// stored error is cleared so a re-execution recovers cleanly.
    /// Returns false when the task does not exist.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<bool> {
        let mut sets: Vec<&str> = vec!["status = ?", "updated_at = ?"];
        if update.error.is_some() {
            sets.push("error = ?");
        } else if status == TaskStatus::Completed {
            sets.push("error = NULL");
        }
        if update.result.is_some() {
            sets.push("result = ?");
        }
        if update.progress.is_some() {
            sets.push("progress = ?");
        }
        if update.started_at.is_some() {
            sets.push("started_at = ?");
        }
        if update.completed_at.is_some() {
            sets.push("completed_at = ?");
        }

        let sql = format!("UPDATE {} SET {} WHERE id = ?", self.table(), sets.join(", "));
        let mut q = sqlx::query(&sql).bind(status).bind(Utc::now());
        if let Some(error) = &update.error {
            q = q.bind(error.clone());
        }
        if let Some(result) = &update.result {
            q = q.bind(serde_json::to_string(result)?);
        }
        if let Some(progress) = update.progress {
            q = q.bind(progress);
        }
        if let Some(started_at) = update.started_at {
            q = q.bind(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            q = q.bind(completed_at);
        }
        let result = q
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update status of task {id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace a task's inputs. Returns false when the task does not exist.
    pub async fn update_inputs(&self, id: &str, inputs: &JsonMap) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET inputs = ?, updated_at = ? WHERE id = ?",
            self.table()
        ))
        .bind(serde_json::to_string(inputs)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update inputs of task {id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace a task's dependency list.
    ///
    /// Only `pending` tasks may have their dependencies replaced, every
    /// referent must live in the same tree, and the tree's dependency graph
    /// must stay acyclic. `parent_id` and `user_id` have no update path at
    /// all; they are immutable after creation.
    pub async fn update_dependencies(&self, id: &str, deps: &[TaskDependency]) -> Result<()> {
        let task = self
            .get_task(id)
            .await?
            .with_context(|| format!("task {id} not found"))?;

        if task.status != TaskStatus::Pending {
            bail!(
                "cannot replace dependencies of task {}: status is {}, expected pending",
                id,
                task.status
            );
        }

        let root = self.root_of(&task).await?;
        let tree_tasks = self.all_in_tree(&root).await?;
        let tree_ids: HashSet<&str> = tree_tasks.iter().map(|t| t.id.as_str()).collect();

        for dep in deps {
            if !tree_ids.contains(dep.id()) {
                bail!(
                    "dependency {:?} of task {} is not part of the same task tree",
                    dep.id(),
                    id
                );
            }
        }

        // Re-run the cycle check over the tree with this task's list replaced.
        let edges: Vec<(String, Vec<String>)> = tree_tasks
            .iter()
            .map(|t| {
                let list = if t.id == id { deps } else { t.dependencies.as_slice() };
                (
                    t.id.clone(),
                    list.iter().map(|d| d.id().to_owned()).collect(),
                )
            })
            .collect();
        if let Some(cycle) = dependency_cycle(&edges) {
            bail!(
                "circular dependency detected involving tasks: {}",
                cycle.join(", ")
            );
        }

        let result = sqlx::query(&format!(
            "UPDATE {} SET dependencies = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
            self.table()
        ))
        .bind(serde_json::to_string(deps)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update dependencies of task {id}"))?;

        if result.rows_affected() == 0 {
            bail!("task {id} changed status while replacing dependencies");
        }
        Ok(())
    }

    /// Hard-delete a task row. Returns false when the task does not exist.
    /// Callers orchestrate any cascade; the parent's `has_children` flag is
    /// kept in agreement with the remaining child rows.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let task = match self.get_task(id).await? {
            Some(t) => t,
            None => return Ok(false),
        };

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table()))
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete task {id}"))?;

        if let Some(parent_id) = &task.parent_id {
            let remaining: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE parent_id = ?",
                self.table()
            ))
            .bind(parent_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to count remaining children")?;
            if remaining == 0 {
                sqlx::query(&format!(
                    "UPDATE {} SET has_children = 0, updated_at = ? WHERE id = ?",
                    self.table()
                ))
                .bind(Utc::now())
                .bind(parent_id)
                .execute(&self.pool)
                .await
                .context("failed to clear parent has_children flag")?;
            }
        }

        Ok(result.rows_affected() > 0)
    }
}

/// Kahn's algorithm over the dependency edges. Returns the ids stuck in a
/// cycle, or None when the graph is a DAG. Edges targeting ids outside the
/// node set are ignored.
pub fn dependency_cycle(edges: &[(String, Vec<String>)]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = edges
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let n = edges.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];
    for (i, (_, deps)) in edges.iter().enumerate() {
        for dep in deps {
            if let Some(&j) = index.get(dep.as_str()) {
                adj[j].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted == n {
        None
    } else {
        Some(
            in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| edges[i].0.clone())
                .collect(),
        )
    }
}
