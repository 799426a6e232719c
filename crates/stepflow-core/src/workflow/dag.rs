//! Step dependency graph derived from variable references.
//!
//! A step depends on another step when its params or condition reference
//! that step's `outputAs`. Edges are built with `petgraph`; a topological
//! sort rejects cycles, including a step referencing its own output.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use stepflow_types::workflow::{StepDefinition, WorkflowDefinition};

use super::context::INPUT_ROOT;
use super::definition::WorkflowError;
use super::variables::{parse_reference, scan_markers, VariableRef};

/// References made by a step's params and condition. Malformed markers are
/// skipped here; validation reports them.
pub fn step_references(step: &StepDefinition) -> Vec<VariableRef> {
    let mut refs = Vec::new();
    collect_lenient(&step.params, &mut refs);
    if let Some(condition) = &step.condition {
        collect_text(condition, &mut refs);
    }
    refs
}

fn collect_text(text: &str, out: &mut Vec<VariableRef>) {
    for span in scan_markers(text) {
        if let Ok(reference) = parse_reference(span.inner(text)) {
            out.push(reference);
        }
    }
}

fn collect_lenient(value: &serde_json::Value, out: &mut Vec<VariableRef>) {
    match value {
        serde_json::Value::String(s) => collect_text(s, out),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_lenient(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_lenient(v, out)),
        _ => {}
    }
}

/// Dependencies between steps, indexed by definition order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph, failing on any cycle.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let producers: HashMap<&str, usize> = def
            .steps
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(i, s)| s.output_as.as_deref().map(|name| (name, i)))
            .collect();

        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = def.steps.iter().map(|s| graph.add_node(s.name.as_str())).collect();

        let mut dependencies = vec![BTreeSet::new(); def.steps.len()];
        for (i, step) in def.steps.iter().enumerate() {
            for reference in step_references(step) {
                if reference.root == INPUT_ROOT {
                    continue;
                }
                let Some(&producer) = producers.get(reference.root.as_str()) else {
                    continue;
                };
                if producer == i {
                    return Err(WorkflowError::CycleDetected(format!(
                        "step '{}' references its own output '{}'",
                        step.name, reference.root
                    )));
                }
                if dependencies[i].insert(producer) {
                    graph.add_edge(nodes[producer], nodes[i], ());
                }
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            WorkflowError::CycleDetected(format!(
                "cycle detected involving step '{}'",
                graph[cycle.node_id()]
            ))
        })?;

        Ok(Self {
            dependencies: dependencies.into_iter().map(|d| d.into_iter().collect()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Steps that must settle before step `index` may run.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }
}
