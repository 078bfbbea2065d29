//! Route handlers grouped by resource.

pub mod awakeable;
pub mod job;
