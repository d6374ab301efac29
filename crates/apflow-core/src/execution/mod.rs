//! Execution: dependency resolution, tree creation and copying, the
//! per-tree scheduling loop, and the process facade.

pub mod creator;
pub mod manager;
pub mod resolver;
pub mod task_executor;
pub mod tree;

pub use creator::{TaskCreateError, TaskCreator};
pub use manager::{ManagerConfig, TaskManager, TreeOutcome};
pub use task_executor::{
    CancelOutcome, ExecuteOptions, ExecutionOutcome, TaskExecutor, global_executor,
    init_global_executor,
};
