//! Observability for nuoc: the global tracing subscriber.

pub mod tracing_setup;
