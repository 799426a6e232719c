//! Module callable contract and the closed module registry.
//!
//! A module is an async function taking one JSON object and returning a JSON
//! value or a [`ModuleError`]. Modules are registered once at startup under a
//! `category.module.function` path; the registry is then frozen behind `Arc`.

pub mod box_module;
pub mod registry;

use serde_json::Value;

pub use box_module::{BoxModule, FnModule, ModuleDyn};
pub use registry::{ModuleDescriptor, ModuleRegistry, RegistryError};

/// Error returned by a module invocation.
///
/// `details` carries the module's own error payload (an HTTP response body,
/// an API error object) and is kept on the failed step record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ModuleError {
    pub message: String,
    pub details: Option<Value>,
}

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Trait for side-effecting integration calls.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
/// Implementations must be safe to wrap with a timeout and keep no
/// engine-observable state between calls.
pub trait Module: Send + Sync {
    /// Invoke the module with resolved parameters.
    fn call(
        &self,
        input: Value,
    ) -> impl std::future::Future<Output = Result<Value, ModuleError>> + Send;
}
