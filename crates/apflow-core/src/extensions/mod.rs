//! Extensions: the executor contract, the extension registry, and the
//! built-in executors.

pub mod aggregate;
pub mod executor;
pub mod registry;
pub mod system_info;

pub use aggregate::AggregateResultsExecutor;
pub use executor::{ExecutionStatus, Executor, ExecutorInit, ExecutorResult};
pub use registry::{
    ExecutorFactory, ExtensionCategory, ExtensionMeta, ExtensionRegistry, RegistryError,
    global_registry,
};
pub use system_info::SystemInfoExecutor;

/// Register the built-in executors on a registry.
pub fn register_builtin_executors(
    registry: &ExtensionRegistry,
) -> Result<(), RegistryError> {
    SystemInfoExecutor::register(registry)?;
    AggregateResultsExecutor::register(registry)?;
    Ok(())
}
