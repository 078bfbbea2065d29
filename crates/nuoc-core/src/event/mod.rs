//! Live mirror of the audit log.
//!
//! Every event the state machine persists is also published on an
//! `EventBus` so in-process observers can follow jobs without polling.

pub mod bus;

pub use bus::EventBus;
