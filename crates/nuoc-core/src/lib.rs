//! Engine logic and the store trait for nuoc.
//!
//! This crate defines the `DurableStore` port that the infrastructure layer
//! implements, an in-memory implementation of it, and everything that runs
//! on top: the replay journal, the invocation state machine, awakeables,
//! the task executor, the DAG scheduler and the background driver. It
//! depends only on `nuoc-types` -- never on `nuoc-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
