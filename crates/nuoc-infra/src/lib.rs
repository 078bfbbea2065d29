//! Infrastructure layer for nuoc.
//!
//! Implements the `DurableStore` port from `nuoc-core` on SQLite, loads the
//! engine configuration from TOML and provides the built-in shell command
//! task handler.

pub mod config;
pub mod handler;
pub mod sqlite;
