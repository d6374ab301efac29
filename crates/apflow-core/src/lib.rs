//! Task-tree orchestration core: the extension, tool, and config
//! registries, the dependency resolver, the task creator, the per-tree
//! task manager, and the task-executor facade.
//!
//! Storage lives in `apflow-db`; transport adapters sit on top of the
//! [`execution::TaskExecutor`] facade and the streaming event types.

pub mod config;
pub mod execution;
pub mod extensions;
pub mod streaming;
pub mod tools;

pub use config::{ConfigRegistry, TreeHookKind, global_config};
pub use execution::{
    ExecuteOptions, ExecutionOutcome, ManagerConfig, TaskCreator, TaskExecutor, TaskManager,
};
pub use extensions::{
    ExecutionStatus, Executor, ExecutorInit, ExecutorResult, ExtensionRegistry, global_registry,
};
pub use streaming::{StreamingCallback, TaskStreamEvent};
pub use tools::{Tool, ToolRegistry, global_tools};
