//! Observability setup for stepflow: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;
