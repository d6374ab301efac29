use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object map used for the structured task columns.
pub type JsonMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True for `completed`, `failed`, and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Roll-up precedence: `failed > cancelled > in_progress > pending > completed`.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Failed => 4,
            Self::Cancelled => 3,
            Self::InProgress => 2,
            Self::Pending => 1,
            Self::Completed => 0,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// A reference from one task to another task in the same tree.
///
/// Accepts either a bare task id string or a `{id, required}` object;
/// a bare string is equivalent to `{id, required: true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDependency {
    Id(String),
    Spec {
        id: String,
        #[serde(default = "default_true")]
        required: bool,
    },
}

impl TaskDependency {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Spec { id, .. } => id,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            Self::Id(_) => true,
            Self::Spec { required, .. } => *required,
        }
    }

    /// True when the dependency was given as a bare id string.
    pub fn is_bare(&self) -> bool {
        matches!(self, Self::Id(_))
    }

    pub fn required_on(id: impl Into<String>) -> Self {
        Self::Spec {
            id: id.into(),
            required: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row -- the unit of work within a task tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
    pub name: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub dependencies: Vec<TaskDependency>,
    pub inputs: JsonMap,
    pub params: JsonMap,
    pub schemas: JsonMap,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub progress: f64,
    pub has_children: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Values of user-defined columns declared on the active table schema.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: JsonMap,
}

impl Task {
    /// The executor id this task dispatches to (`schemas.method`).
    pub fn executor_id(&self) -> Option<&str> {
        self.schemas.get("method").and_then(Value::as_str)
    }

    /// The declared input schema, if any (`schemas.input_schema`).
    pub fn input_schema(&self) -> Option<&Value> {
        self.schemas.get("input_schema")
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn default_priority() -> i64 {
    1
}

/// A task creation spec, as accepted in a task-array input.
///
/// Unknown top-level fields are collected into `extra` and matched against
/// the user-defined columns of the active table schema at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    #[serde(default)]
    pub inputs: JsonMap,
    #[serde(default)]
    pub params: JsonMap,
    #[serde(default)]
    pub schemas: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id: None,
            user_id: None,
            name: name.into(),
            priority: default_priority(),
            dependencies: Vec::new(),
            inputs: JsonMap::new(),
            params: JsonMap::new(),
            schemas: JsonMap::new(),
            extra: JsonMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.schemas
            .insert("method".to_owned(), Value::String(method.into()));
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, dep: TaskDependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// The executor id this spec dispatches to (`schemas.method`).
    pub fn executor_id(&self) -> Option<&str> {
        self.schemas.get("method").and_then(Value::as_str)
    }
}

/// Optional fields accompanying a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error: Option<String>,
    pub result: Option<Value>,
    pub progress: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filters and pagination for [`crate::repository::TaskRepository::query_tasks`].
///
/// `parent_id: Some("")` selects root tasks only (no parent).
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub parent_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub order_by: String,
    pub order_desc: bool,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            parent_id: None,
            limit: 100,
            offset: 0,
            order_by: "created_at".to_owned(),
            order_desc: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tree view
// ---------------------------------------------------------------------------

/// In-memory view of a task with its ordered children, rebuilt from the
/// repository by depth-first expansion.
#[derive(Debug, Clone)]
pub struct TaskTreeNode {
    pub task: Task,
    pub children: Vec<TaskTreeNode>,
}

impl TaskTreeNode {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: TaskTreeNode) {
        self.children.push(child);
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-first iteration over all tasks in the subtree, root first.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        let mut out: Vec<&Task> = Vec::new();
        let mut stack: Vec<&TaskTreeNode> = vec![self];
        while let Some(node) = stack.pop() {
            out.push(&node.task);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out.into_iter()
    }

    /// Total number of tasks in the subtree.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Find a node by task id within the subtree.
    pub fn find(&self, task_id: &str) -> Option<&TaskTreeNode> {
        if self.task.id == task_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(task_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn status_precedence_ordering() {
        assert!(TaskStatus::Failed.precedence() > TaskStatus::Cancelled.precedence());
        assert!(TaskStatus::Cancelled.precedence() > TaskStatus::InProgress.precedence());
        assert!(TaskStatus::InProgress.precedence() > TaskStatus::Pending.precedence());
        assert!(TaskStatus::Pending.precedence() > TaskStatus::Completed.precedence());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn dependency_bare_string_deserializes() {
        let dep: TaskDependency = serde_json::from_value(json!("task-a")).unwrap();
        assert_eq!(dep.id(), "task-a");
        assert!(dep.required());
        assert!(dep.is_bare());
    }

    #[test]
    fn dependency_object_deserializes() {
        let dep: TaskDependency =
            serde_json::from_value(json!({"id": "task-b", "required": false})).unwrap();
        assert_eq!(dep.id(), "task-b");
        assert!(!dep.required());
        assert!(!dep.is_bare());
    }

    #[test]
    fn dependency_object_required_defaults_true() {
        let dep: TaskDependency = serde_json::from_value(json!({"id": "task-c"})).unwrap();
        assert!(dep.required());
    }

    #[test]
    fn task_spec_collects_unknown_fields_as_extra() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "name": "report",
            "project_id": "proj-7",
            "inputs": {"resource": "cpu"}
        }))
        .unwrap();
        assert_eq!(spec.name, "report");
        assert_eq!(spec.priority, 1);
        assert_eq!(spec.extra.get("project_id"), Some(&json!("proj-7")));
    }

    #[test]
    fn task_spec_builder_sets_method() {
        let spec = TaskSpec::new("probe").with_method("system_info");
        assert_eq!(spec.executor_id(), Some("system_info"));
    }

    #[test]
    fn tree_node_iter_is_depth_first() {
        fn leaf(id: &str) -> Task {
            let spec = TaskSpec::new(id).with_id(id);
            Task {
                id: spec.id.clone().unwrap(),
                parent_id: None,
                user_id: None,
                name: spec.name,
                status: TaskStatus::Pending,
                priority: 1,
                dependencies: vec![],
                inputs: JsonMap::new(),
                params: JsonMap::new(),
                schemas: JsonMap::new(),
                result: None,
                error: None,
                progress: 0.0,
                has_children: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                started_at: None,
                completed_at: None,
                extra: JsonMap::new(),
            }
        }

        let mut root = TaskTreeNode::new(leaf("r"));
        let mut a = TaskTreeNode::new(leaf("a"));
        a.add_child(TaskTreeNode::new(leaf("a1")));
        root.add_child(a);
        root.add_child(TaskTreeNode::new(leaf("b")));

        let order: Vec<&str> = root.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["r", "a", "a1", "b"]);
        assert_eq!(root.len(), 4);
        assert!(root.find("a1").is_some());
        assert!(root.find("zz").is_none());
    }
}
