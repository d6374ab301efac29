//! Process-wide configuration registry: the active task table schema,
//! per-task pre/post hooks, tree lifecycle hooks, and behavior knobs.
//!
//! Hooks are registered at startup (builder-style) and read by the executor
//! facade at dispatch. Hook failures are logged and swallowed by callers;
//! they never abort task execution.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Result;
use futures::future::BoxFuture;

use apflow_db::models::{JsonMap, Task};
use apflow_db::schema::TaskTableSchema;

/// Runs just before an executor is dispatched. May mutate `task.inputs`.
pub type PreHook = Arc<dyn for<'a> Fn(&'a mut Task) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Runs just after a successful executor return. Receives read-only views
/// of the task, the inputs the executor saw, and the persisted result.
pub type PostHook = Arc<
    dyn for<'a> Fn(&'a Task, &'a JsonMap, &'a serde_json::Value) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// Fires around whole-tree lifecycle points with the root task snapshot.
pub type TreeHook = Arc<dyn for<'a> Fn(&'a Task) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Whole-tree lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeHookKind {
    Created,
    Started,
    Completed,
    Failed,
}

impl fmt::Display for TreeHookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "on_tree_created",
            Self::Started => "on_tree_started",
            Self::Completed => "on_tree_completed",
            Self::Failed => "on_tree_failed",
        };
        f.write_str(s)
    }
}

const DEMO_SLEEP_SCALE_ENV: &str = "APFLOW_DEMO_SLEEP_SCALE";

struct ConfigInner {
    task_schema: Arc<TaskTableSchema>,
    pre_hooks: Vec<PreHook>,
    post_hooks: Vec<PostHook>,
    tree_hooks: HashMap<TreeHookKind, Vec<TreeHook>>,
    use_task_creator: bool,
    require_existing_tasks: bool,
    demo_sleep_scale: f64,
}

impl ConfigInner {
    fn fresh() -> Self {
        let demo_sleep_scale = env::var(DEMO_SLEEP_SCALE_ENV)
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0);
        Self {
            task_schema: Arc::new(TaskTableSchema::default()),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            tree_hooks: HashMap::new(),
            use_task_creator: true,
            require_existing_tasks: false,
            demo_sleep_scale,
        }
    }
}

/// Process-wide configuration state.
pub struct ConfigRegistry {
    inner: RwLock<ConfigInner>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ConfigInner::fresh()),
        }
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigInner> {
        self.inner.read().expect("config registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConfigInner> {
        self.inner.write().expect("config registry lock poisoned")
    }

    // -- task table schema --------------------------------------------------

    pub fn set_task_schema(&self, schema: Arc<TaskTableSchema>) {
        tracing::debug!(table = schema.table(), "set task table schema");
        self.write().task_schema = schema;
    }

    pub fn task_schema(&self) -> Arc<TaskTableSchema> {
        Arc::clone(&self.read().task_schema)
    }

    // -- per-task hooks -----------------------------------------------------

    /// Register a pre-execution hook. Registration is idempotent for the
    /// same `Arc` (pointer identity).
    pub fn register_pre_hook(&self, hook: PreHook) {
        let mut inner = self.write();
        if !inner.pre_hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            inner.pre_hooks.push(hook);
        }
    }

    /// Register a post-execution hook. Registration is idempotent for the
    /// same `Arc` (pointer identity).
    pub fn register_post_hook(&self, hook: PostHook) {
        let mut inner = self.write();
        if !inner.post_hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            inner.post_hooks.push(hook);
        }
    }

    pub fn pre_hooks(&self) -> Vec<PreHook> {
        self.read().pre_hooks.clone()
    }

    pub fn post_hooks(&self) -> Vec<PostHook> {
        self.read().post_hooks.clone()
    }

    // -- tree lifecycle hooks -----------------------------------------------

    pub fn register_tree_hook(&self, kind: TreeHookKind, hook: TreeHook) {
        let mut inner = self.write();
        let hooks = inner.tree_hooks.entry(kind).or_default();
        if !hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            hooks.push(hook);
        }
    }

    pub fn tree_hooks(&self, kind: TreeHookKind) -> Vec<TreeHook> {
        self.read().tree_hooks.get(&kind).cloned().unwrap_or_default()
    }

    // -- knobs --------------------------------------------------------------

    pub fn set_use_task_creator(&self, value: bool) {
        self.write().use_task_creator = value;
    }

    pub fn use_task_creator(&self) -> bool {
        self.read().use_task_creator
    }

    pub fn set_require_existing_tasks(&self, value: bool) {
        self.write().require_existing_tasks = value;
    }

    pub fn require_existing_tasks(&self) -> bool {
        self.read().require_existing_tasks
    }

    /// Multiplier applied to executor-reported demo delays. 0 disables the
    /// delays entirely.
    pub fn set_demo_sleep_scale(&self, scale: f64) {
        self.write().demo_sleep_scale = scale;
    }

    pub fn demo_sleep_scale(&self) -> f64 {
        self.read().demo_sleep_scale
    }

    /// Reset everything to defaults (test setup).
    pub fn clear(&self) {
        *self.write() = ConfigInner::fresh();
    }
}

static GLOBAL: OnceLock<Arc<ConfigRegistry>> = OnceLock::new();

/// The process-wide configuration registry.
pub fn global_config() -> Arc<ConfigRegistry> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConfigRegistry::new())))
}

/// Wrap an async closure as a [`PreHook`].
pub fn pre_hook<F>(f: F) -> PreHook
where
    F: for<'a> Fn(&'a mut Task) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as a [`PostHook`].
pub fn post_hook<F>(f: F) -> PostHook
where
    F: for<'a> Fn(&'a Task, &'a JsonMap, &'a serde_json::Value) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as a [`TreeHook`].
pub fn tree_hook<F>(f: F) -> TreeHook
where
    F: for<'a> Fn(&'a Task) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(f)
}
