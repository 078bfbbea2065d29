//! SQLite storage layer.
//!
//! `SqliteStore` implements `DurableStore` on a WAL-mode database with split
//! read/write connection pools. Every `WriteBatch` is one transaction on the
//! single-connection writer.

pub mod pool;
mod rows;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteStore;
