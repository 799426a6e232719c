//! Data and timing helpers: `core.data.echo`, `core.data.merge`,
//! `core.time.delay`.

use std::time::Duration;

use serde_json::{Map, Value};

use stepflow_core::module::{BoxModule, FnModule, ModuleDescriptor, ModuleError};
use stepflow_types::module::{ModulePathError, ParamSpec, ParamType};

pub(crate) fn descriptors() -> Result<Vec<ModuleDescriptor>, ModulePathError> {
    Ok(vec![
        ModuleDescriptor::new(
            "core.data.echo",
            "Return the resolved parameters unchanged",
            BoxModule::new(FnModule::new(|input| async move { Ok::<_, ModuleError>(input) })),
        )?,
        ModuleDescriptor::new(
            "core.data.merge",
            "Shallow-merge a list of objects, later keys win",
            BoxModule::new(FnModule::new(|input| async move { merge(input) })),
        )?
        .with_params(vec![ParamSpec::required(
            "objects",
            ParamType::Array,
            "Objects to merge, in order",
        )]),
        ModuleDescriptor::new(
            "core.time.delay",
            "Sleep, then return `value`",
            BoxModule::new(FnModule::new(|input| async move { delay(input).await })),
        )?
        .with_params(vec![
            ParamSpec::required("ms", ParamType::Number, "Milliseconds to sleep"),
            ParamSpec::optional("value", ParamType::Any, "Returned after the delay"),
        ]),
    ])
}

fn merge(input: Value) -> Result<Value, ModuleError> {
    let objects = input
        .get("objects")
        .and_then(Value::as_array)
        .ok_or_else(|| ModuleError::new("`objects` must be an array of objects"))?;

    let mut merged = Map::new();
    for (index, object) in objects.iter().enumerate() {
        let map = object.as_object().ok_or_else(|| {
            ModuleError::new(format!("objects[{index}] is not an object")).with_details(object.clone())
        })?;
        merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Ok(Value::Object(merged))
}

async fn delay(input: Value) -> Result<Value, ModuleError> {
    let ms = input
        .get("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| ModuleError::new("`ms` must be a non-negative integer"))?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(input.get("value").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_later_keys_win() {
        let out = merge(json!({"objects": [{"a": 1, "b": 1}, {"b": 2}, {"c": [3]}]})).unwrap();
        assert_eq!(out, json!({"a": 1, "b": 2, "c": [3]}));
    }

    #[test]
    fn test_merge_rejects_non_objects() {
        let err = merge(json!({"objects": [{"a": 1}, "nope"]})).unwrap_err();
        assert!(err.message.contains("objects[1]"));
        assert_eq!(err.details, Some(json!("nope")));

        assert!(merge(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_delay_returns_value() {
        let out = delay(json!({"ms": 5, "value": {"ok": true}})).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
        assert_eq!(delay(json!({"ms": 0})).await.unwrap(), Value::Null);
        assert!(delay(json!({"ms": "soon"})).await.is_err());
    }

    #[tokio::test]
    async fn test_echo_descriptor() {
        let descriptors = descriptors().unwrap();
        let echo = descriptors
            .iter()
            .find(|d| d.path.to_string() == "core.data.echo")
            .unwrap();
        let out = echo.callable.call(json!({"hello": "world"})).await.unwrap();
        assert_eq!(out, json!({"hello": "world"}));
    }
}
