//! Store trait definition (port) and the in-memory implementation.
//!
//! The SQLite implementation lives in nuoc-infra. The core crate never
//! depends on any specific storage technology.

pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::{AwakeableWrite, DurableStore, Guard, JobWrite, TaskWrite, WriteBatch};
