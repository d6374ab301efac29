//! Tool registry -- a flat name-to-object map for executors that embed a
//! tool concept (e.g. an agent executor whose configuration lists tools by
//! string). Tools are registered explicitly at startup; string references
//! are resolved against the registry.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;

/// A callable tool an executor can hand to its agent configuration.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Invoke the tool with a JSON argument payload.
    fn call(&self, args: Value) -> Result<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Errors raised by tool registration and resolution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {0:?} is already registered; pass override to replace it")]
    Duplicate(String),

    #[error("tool {0:?} is not registered")]
    Unknown(String),
}

/// Reference to a tool: a registered name (a trailing `()` is tolerated)
/// or a concrete tool object.
#[derive(Clone)]
pub enum ToolRef {
    Name(String),
    Object(Arc<dyn Tool>),
}

impl From<&str> for ToolRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<Arc<dyn Tool>> for ToolRef {
    fn from(tool: Arc<dyn Tool>) -> Self {
        Self::Object(tool)
    }
}

/// Flat name -> tool map.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        tool: Arc<dyn Tool>,
        override_: bool,
    ) -> Result<(), ToolError> {
        let name = name.into();
        let mut tools = self.tools.write().expect("tool registry lock poisoned");
        if tools.contains_key(&name) && !override_ {
            return Err(ToolError::Duplicate(name));
        }
        tracing::debug!(tool = %name, "registered tool");
        tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve a tool reference to a concrete tool object.
    pub fn resolve(&self, tool_ref: &ToolRef) -> Result<Arc<dyn Tool>, ToolError> {
        match tool_ref {
            ToolRef::Object(tool) => Ok(Arc::clone(tool)),
            ToolRef::Name(name) => {
                let stripped = name.strip_suffix("()").unwrap_or(name);
                self.get(stripped)
                    .ok_or_else(|| ToolError::Unknown(stripped.to_owned()))
            }
        }
    }
}

static GLOBAL: OnceLock<Arc<ToolRegistry>> = OnceLock::new();

/// The process-wide tool registry.
pub fn global_tools() -> Arc<ToolRegistry> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(ToolRegistry::new())))
}
