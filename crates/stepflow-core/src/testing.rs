//! Instrumented fake modules shared by engine and queue tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use stepflow_types::workflow::WorkflowDefinition;

use crate::module::{BoxModule, FnModule, ModuleDescriptor, ModuleError, ModuleRegistry};

/// Start and end instants of one module call.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub start: Instant,
    pub end: Instant,
}

impl Window {
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Records call windows by label.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    windows: Arc<Mutex<Vec<(String, Window)>>>,
}

impl Timeline {
    pub fn window(&self, label: &str) -> Window {
        let windows = self.windows.lock().unwrap();
        windows
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, w)| *w)
            .unwrap_or_else(|| panic!("no window recorded for {label}"))
    }

    fn push(&self, label: String, window: Window) {
        self.windows.lock().unwrap().push((label, window));
    }
}

/// Sleeps `input.ms`, records the window under `input.label` and returns
/// `input.value` (or the whole input).
pub fn timed_module(timeline: &Timeline) -> BoxModule {
    let timeline = timeline.clone();
    BoxModule::new(FnModule::new(move |input: Value| {
        let timeline = timeline.clone();
        async move {
            let start = Instant::now();
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let label = input["label"].as_str().unwrap_or("").to_string();
            timeline.push(label, Window { start, end: Instant::now() });
            Ok::<_, ModuleError>(input.get("value").cloned().unwrap_or(input))
        }
    }))
}

/// Always fails with `input` as the error details; counts calls.
pub fn failing_module(calls: &Arc<AtomicU32>) -> BoxModule {
    let calls = Arc::clone(calls);
    BoxModule::new(FnModule::new(move |input: Value| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(ModuleError::new("upstream rejected the call").with_details(input))
        }
    }))
}

/// Registry with `test.data.echo`, `test.time.sleep` (timed) and
/// `flaky.api.call` (always fails).
pub fn registry(timeline: &Timeline, failures: &Arc<AtomicU32>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    let echo = BoxModule::new(FnModule::new(|input: Value| async move {
        Ok::<_, ModuleError>(input)
    }));
    registry
        .register(ModuleDescriptor::new("test.data.echo", "Echo", echo).unwrap())
        .unwrap();
    registry
        .register(ModuleDescriptor::new("test.time.sleep", "Sleep", timed_module(timeline)).unwrap())
        .unwrap();
    registry
        .register(ModuleDescriptor::new("flaky.api.call", "Fails", failing_module(failures)).unwrap())
        .unwrap();
    registry
}

/// Parse a YAML definition.
pub fn definition(yaml: &str) -> WorkflowDefinition {
    serde_yaml_ng::from_str(yaml).unwrap()
}

pub fn single_echo_definition() -> WorkflowDefinition {
    serde_json::from_value(json!({
        "name": "echo",
        "steps": [
            {"name": "greet", "module": "test.data.echo",
             "params": {"hello": "{{input.name}}"}, "outputAs": "greeting"}
        ]
    }))
    .unwrap()
}
