//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepflow-infra) implements. The core crate never depends on any
//! specific storage technology; [`memory`] holds in-process implementations
//! used by tests and by embedders that do not need durability.

pub mod memory;
pub mod run;
pub mod workflow;

pub use memory::{InMemoryRunStore, InMemoryWorkflowStore};
pub use run::RunStore;
pub use workflow::WorkflowStore;
