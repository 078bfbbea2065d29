//! HTTP API for nuoc.
//!
//! Axum server that lets external systems resolve or reject awakeables and
//! submit, inspect and cancel jobs. Every body is a JSON object carrying a
//! `success` flag.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
