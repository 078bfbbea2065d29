//! Durable workflow engine.
//!
//! Leaf-first: `dag`, `condition`, `gate` and `retry` are pure helpers;
//! `journal` and `state` own persistence; `awakeable` builds suspension on
//! top of both; `executor` runs one task; `scheduler` runs a job; `driver`
//! runs the sweeps and hands due jobs to the scheduler.

pub mod awakeable;
pub mod condition;
pub mod dag;
pub mod definition;
pub mod driver;
pub mod executor;
pub mod gate;
pub mod handler;
pub mod journal;
pub mod retry;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
