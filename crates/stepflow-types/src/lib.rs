//! Shared domain types for stepflow.
//!
//! Workflow definitions, runs and their step records, module descriptors,
//! queue jobs and engine configuration, plus the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod module;
pub mod queue;
pub mod workflow;
