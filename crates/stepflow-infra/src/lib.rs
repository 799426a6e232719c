//! Infrastructure layer for stepflow.
//!
//! Implements the ports defined in `stepflow-core`: SQLite workflow, run and
//! job stores, the configuration loader, and the built-in modules.

pub mod config;
pub mod modules;
pub mod sqlite;
