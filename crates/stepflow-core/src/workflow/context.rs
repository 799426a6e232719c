//! Output bag: the named values a run has produced so far.
//!
//! Holds the trigger data under the reserved root `input` plus one entry per
//! succeeded step with an `outputAs`. Variable references walk this tree.

use std::collections::HashMap;

use serde_json::Value;

use super::variables::VariableRef;

/// Reserved reference root for trigger data.
pub const INPUT_ROOT: &str = "input";

#[derive(Debug, Clone, Default)]
pub struct OutputBag {
    input: Value,
    outputs: HashMap<String, Value>,
}

impl OutputBag {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            outputs: HashMap::new(),
        }
    }

    /// Store a step output under its `outputAs` name.
    pub fn insert(&mut self, output_as: impl Into<String>, value: Value) {
        self.outputs.insert(output_as.into(), value);
    }

    /// The value bound to a root name, if any.
    pub fn root(&self, name: &str) -> Option<&Value> {
        if name == INPUT_ROOT {
            Some(&self.input)
        } else {
            self.outputs.get(name)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root(name).is_some()
    }

    /// Resolve a parsed reference. `None` if any segment is missing.
    pub fn lookup(&self, reference: &VariableRef) -> Option<&Value> {
        reference.walk(self.root(&reference.root)?)
    }

    pub fn input(&self) -> &Value {
        &self.input
    }
}
