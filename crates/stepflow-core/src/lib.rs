//! Workflow engine and port definitions for stepflow.
//!
//! This crate defines the "ports" (store and queue traits) that the
//! infrastructure layer implements. It depends only on `stepflow-types`,
//! never on `stepflow-infra` or any database/IO crate.

pub mod event;
pub mod module;
pub mod queue;
pub mod repository;
pub mod resilience;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
