//! Extension registry -- globally unique id to executor factory plus
//! metadata, with a category/type secondary index.
//!
//! The registry lets the task manager look up an executor by the id a task
//! carries in `schemas.method` and build a fresh instance per execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Result;
use thiserror::Error;

use super::executor::{Executor, ExecutorInit};

/// Category of a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionCategory {
    Executor,
    Storage,
    Hook,
}

impl fmt::Display for ExtensionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executor => "executor",
            Self::Storage => "storage",
            Self::Hook => "hook",
        };
        f.write_str(s)
    }
}

/// Metadata describing a registered extension.
#[derive(Debug, Clone)]
pub struct ExtensionMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: ExtensionCategory,
    pub type_name: String,
}

impl ExtensionMeta {
    pub fn executor(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            category: ExtensionCategory::Executor,
            type_name: type_name.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Builds a fresh executor instance for one task execution.
pub type ExecutorFactory = Arc<dyn Fn(ExecutorInit) -> Result<Box<dyn Executor>> + Send + Sync>;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("extension id must not be empty")]
    EmptyId,

    #[error("extension id {0:?} is already registered; pass override to replace it")]
    DuplicateId(String),

    #[error("no extension registered with id {0:?}")]
    UnknownId(String),

    #[error("extension {0:?} is not an executor")]
    NotAnExecutor(String),
}

struct Entry {
    meta: ExtensionMeta,
    factory: Option<ExecutorFactory>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Entry>,
    // category -> type -> registration-ordered ids
    by_category: HashMap<ExtensionCategory, HashMap<String, Vec<String>>>,
}

/// Registry of extensions, keyed primarily by globally unique id.
#[derive(Default)]
pub struct ExtensionRegistry {
    inner: RwLock<Inner>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension. Fails on a duplicate id unless `override_`
    /// is set, in which case the previous registration is replaced.
    pub fn register(
        &self,
        meta: ExtensionMeta,
        factory: Option<ExecutorFactory>,
        override_: bool,
    ) -> Result<(), RegistryError> {
        if meta.id.is_empty() {
            return Err(RegistryError::EmptyId);
        }

        let mut inner = self.inner.write().expect("extension registry lock poisoned");
        if inner.by_id.contains_key(&meta.id) {
            if !override_ {
                return Err(RegistryError::DuplicateId(meta.id));
            }
            remove_from_index(&mut inner, &meta.id);
        }

        tracing::info!(
            id = %meta.id,
            category = %meta.category,
            extension_type = %meta.type_name,
            "registered extension"
        );

        inner
            .by_category
            .entry(meta.category)
            .or_default()
            .entry(meta.type_name.clone())
            .or_default()
            .push(meta.id.clone());
        inner
            .by_id
            .insert(meta.id.clone(), Entry { meta, factory });
        Ok(())
    }

    /// Register an executor extension with its factory.
    pub fn register_executor(
        &self,
        meta: ExtensionMeta,
        factory: ExecutorFactory,
    ) -> Result<(), RegistryError> {
        self.register(meta, Some(factory), false)
    }

    /// Remove a registration. Returns true when something was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("extension registry lock poisoned");
        if inner.by_id.contains_key(id) {
            remove_from_index(&mut inner, id);
            inner.by_id.remove(id);
            true
        } else {
            false
        }
    }

    /// Metadata lookup by id.
    pub fn get_by_id(&self, id: &str) -> Option<ExtensionMeta> {
        self.inner
            .read()
            .expect("extension registry lock poisoned")
            .by_id
            .get(id)
            .map(|e| e.meta.clone())
    }

    /// First extension registered under `category` + `type_name`.
    pub fn get_by_type(&self, category: ExtensionCategory, type_name: &str) -> Option<ExtensionMeta> {
        let inner = self.inner.read().expect("extension registry lock poisoned");
        let id = inner
            .by_category
            .get(&category)?
            .get(type_name)?
            .first()?
            .clone();
        inner.by_id.get(&id).map(|e| e.meta.clone())
    }

    /// All registrations in a category, in registration order per type.
    pub fn list_by_category(&self, category: ExtensionCategory) -> Vec<ExtensionMeta> {
        let inner = self.inner.read().expect("extension registry lock poisoned");
        let Some(types) = inner.by_category.get(&category) else {
            return Vec::new();
        };
        types
            .values()
            .flatten()
            .filter_map(|id| inner.by_id.get(id).map(|e| e.meta.clone()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .expect("extension registry lock poisoned")
            .by_id
            .contains_key(id)
    }

    /// True when `id` names a registered executor with a factory.
    pub fn has_executor(&self, id: &str) -> bool {
        self.inner
            .read()
            .expect("extension registry lock poisoned")
            .by_id
            .get(id)
            .is_some_and(|e| e.meta.category == ExtensionCategory::Executor && e.factory.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("extension registry lock poisoned")
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a fresh executor instance for one task execution.
    pub fn create_executor_instance(
        &self,
        id: &str,
        init: ExecutorInit,
    ) -> Result<Box<dyn Executor>> {
        let factory = {
            let inner = self.inner.read().expect("extension registry lock poisoned");
            let entry = inner
                .by_id
                .get(id)
                .ok_or_else(|| RegistryError::UnknownId(id.to_owned()))?;
            if entry.meta.category != ExtensionCategory::Executor {
                return Err(RegistryError::NotAnExecutor(id.to_owned()).into());
            }
            entry
                .factory
                .clone()
                .ok_or_else(|| RegistryError::NotAnExecutor(id.to_owned()))?
        };
        factory(init)
    }
}

fn remove_from_index(inner: &mut Inner, id: &str) {
    if let Some(entry) = inner.by_id.get(id) {
        let category = entry.meta.category;
        let type_name = entry.meta.type_name.clone();
        if let Some(types) = inner.by_category.get_mut(&category) {
            if let Some(ids) = types.get_mut(&type_name) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    types.remove(&type_name);
                }
            }
        }
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().expect("extension registry lock poisoned");
        f.debug_struct("ExtensionRegistry")
            .field("extensions", &inner.by_id.keys().collect::<Vec<_>>())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<ExtensionRegistry>> = OnceLock::new();

/// The process-wide extension registry.
pub fn global_registry() -> Arc<ExtensionRegistry> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(ExtensionRegistry::new())))
}
