//! Shared domain types for nuoc.
//!
//! This crate contains the domain types persisted and exchanged by the
//! durable workflow engine: jobs, tasks, journal entries, awakeables,
//! audit events, branch conditions and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, base64.

pub mod awakeable;
pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod job;
pub mod journal;
pub mod task;

/// Returns true when `s` is a well-formed job or task identifier:
/// `[A-Za-z_][A-Za-z0-9_-]{0,127}`.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    s.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::is_valid_identifier;

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("build"));
        assert!(is_valid_identifier("_phase-2_verify"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("slash/name"));
        assert!(is_valid_identifier(&"a".repeat(128)));
        assert!(!is_valid_identifier(&"a".repeat(129)));
    }
}
