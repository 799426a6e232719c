//! BoxModule -- object-safe dynamic dispatch wrapper for Module.
//!
//! 1. `ModuleDyn` is the object-safe twin of `Module` with a boxed future
//! 2. Blanket-impl `ModuleDyn` for all `T: Module`
//! 3. `BoxModule` wraps `Arc<dyn ModuleDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Module, ModuleError};

/// Object-safe version of [`Module`] with boxed futures.
pub trait ModuleDyn: Send + Sync {
    fn call_boxed(
        &self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ModuleError>> + Send + '_>>;
}

impl<T: Module> ModuleDyn for T {
    fn call_boxed(
        &self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ModuleError>> + Send + '_>> {
        Box::pin(self.call(input))
    }
}

/// Type-erased module callable.
///
/// Cheap to clone: step tasks each hold their own handle to the callable.
#[derive(Clone)]
pub struct BoxModule {
    inner: Arc<dyn ModuleDyn>,
}

impl BoxModule {
    /// Wrap a concrete `Module` in a type-erased handle.
    pub fn new<T: Module + 'static>(module: T) -> Self {
        Self {
            inner: Arc::new(module),
        }
    }

    pub async fn call(&self, input: Value) -> Result<Value, ModuleError> {
        self.inner.call_boxed(input).await
    }
}

impl std::fmt::Debug for BoxModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxModule").finish_non_exhaustive()
    }
}

/// Adapts an async closure into a [`Module`].
///
/// ```ignore
/// let echo = FnModule::new(|input| async move { Ok::<_, ModuleError>(input) });
/// ```
pub struct FnModule<F> {
    func: F,
}

impl<F, Fut> FnModule<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ModuleError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> Module for FnModule<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ModuleError>> + Send,
{
    fn call(&self, input: Value) -> impl Future<Output = Result<Value, ModuleError>> + Send {
        (self.func)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Module for Upper {
        async fn call(&self, input: Value) -> Result<Value, ModuleError> {
            let text = input["text"]
                .as_str()
                .ok_or_else(|| ModuleError::new("text is required"))?;
            Ok(json!(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_box_module_delegates() {
        let module = BoxModule::new(Upper);
        let out = module.call(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[tokio::test]
    async fn test_box_module_propagates_error() {
        let module = BoxModule::new(Upper);
        let err = module.call(json!({})).await.unwrap_err();
        assert_eq!(err.message, "text is required");
        assert!(err.details.is_none());
    }

    #[tokio::test]
    async fn test_fn_module() {
        let module = BoxModule::new(FnModule::new(|input: Value| async move {
            Ok::<_, ModuleError>(json!({ "got": input }))
        }));
        let out = module.call(json!(1)).await.unwrap();
        assert_eq!(out, json!({"got": 1}));
    }

    #[test]
    fn test_module_error_details() {
        let err = ModuleError::new("bad gateway").with_details(json!({"status": 502}));
        assert_eq!(err.to_string(), "bad gateway");
        assert_eq!(err.details, Some(json!({"status": 502})));
    }
}
