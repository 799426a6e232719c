//! Workflow engine core: definition parsing, dependency graph, and execution.
//!
//! - `definition` -- YAML/JSON parsing and validation against the module registry
//! - `variables` -- `{{...}}` reference parsing and resolution
//! - `context` -- Output bag holding trigger input and step outputs
//! - `expression` -- JEXL evaluator for step conditions
//! - `dag` -- Step dependencies derived from variable references
//! - `executor` -- Parallel, dependency-driven run execution
//! - `cron` -- Schedule normalization and cron triggers

pub mod context;
pub mod cron;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod variables;

pub use context::OutputBag;
pub use definition::{
    load_definition_file, parse_definition, serialize_definition_yaml, validate_definition,
    ValidationReport, WorkflowError,
};
pub use executor::{CancelOutcome, EngineError, StepError, WorkflowEngine};
