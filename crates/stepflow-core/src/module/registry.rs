//! Closed registry of module descriptors keyed by `category.module.function`.

use std::collections::HashMap;

use stepflow_types::module::{ModuleInfo, ModulePath, ModulePathError, ParamSpec};

use super::box_module::BoxModule;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    Duplicate(String),

    #[error("module '{0}' is not registered")]
    NotFound(String),
}

/// A registered module: its path, parameter schema and callable.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub path: ModulePath,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub callable: BoxModule,
}

impl ModuleDescriptor {
    pub fn new(
        path: &str,
        description: impl Into<String>,
        callable: BoxModule,
    ) -> Result<Self, ModulePathError> {
        Ok(Self {
            path: ModulePath::parse(path)?,
            description: description.into(),
            params: Vec::new(),
            callable,
        })
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn category(&self) -> &str {
        &self.path.category
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            path: self.path.to_string(),
            description: self.description.clone(),
            params: self.params.clone(),
        }
    }
}

/// Registry of available modules, indexed by full path.
///
/// Populated at startup, then shared read-only as `Arc<ModuleRegistry>`.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. A path collision is a startup error.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), RegistryError> {
        let key = descriptor.path.to_string();
        if self.modules.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        tracing::debug!(module = %key, "registered module");
        self.modules.insert(key, descriptor);
        Ok(())
    }

    /// Exact-match lookup by full path.
    pub fn lookup(&self, path: &str) -> Result<&ModuleDescriptor, RegistryError> {
        self.modules
            .get(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// All registered modules, sorted by path.
    pub fn list(&self) -> Vec<ModuleInfo> {
        let mut infos: Vec<ModuleInfo> = self.modules.values().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
