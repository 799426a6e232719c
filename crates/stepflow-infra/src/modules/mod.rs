//! Built-in modules shipped with stepflow.
//!
//! Registered into a [`ModuleRegistry`] at startup, before the registry is
//! frozen behind `Arc` and handed to the engine.

pub mod builtin;
pub mod http;

use stepflow_core::module::{ModuleRegistry, RegistryError};
use stepflow_types::module::ModulePathError;

pub use http::HttpRequestModule;

#[derive(Debug, thiserror::Error)]
pub enum ModuleSetupError {
    #[error(transparent)]
    Path(#[from] ModulePathError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Register every built-in module.
pub fn register_builtin_modules(registry: &mut ModuleRegistry) -> Result<(), ModuleSetupError> {
    for descriptor in builtin::descriptors()? {
        registry.register(descriptor)?;
    }
    registry.register(http::descriptor(HttpRequestModule::new()?)?)?;
    tracing::debug!(count = registry.len(), "built-in modules registered");
    Ok(())
}
