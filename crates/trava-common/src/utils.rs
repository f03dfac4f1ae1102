//! Utility functions for Trava
//!
//! Common helper functions used across the lock coordination crates.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::LockError;

/// Current wall-clock time as Unix milliseconds.
///
/// All lock timestamps (acquisition, expiry, request creation) are kept in
/// this representation so that the in-process and store-backed strategies
/// compare the same scale.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Normalize a resource name to its canonical (case-insensitive) key form.
pub fn normalize_resource(resource: &str) -> String {
    resource.trim().to_lowercase()
}

/// Validate that an identifier argument (resource or requester) is usable.
///
/// Empty or whitespace-only values are rejected with a validation error;
/// validation failures are never retried.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), LockError> {
    if value.trim().is_empty() {
        return Err(LockError::Validation(format!(
            "{kind} must not be empty or whitespace"
        )));
    }
    Ok(())
}

/// Case-insensitive equality for holders and requesters.
pub fn identifier_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_monotonic_enough() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after 2020
    }

    #[test]
    fn test_normalize_resource() {
        assert_eq!(normalize_resource("  My.Resource "), "my.resource");
        assert_eq!(normalize_resource("ABC"), "abc");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("resource", "jobs/payroll").is_ok());
        assert!(validate_identifier("resource", "").is_err());
        assert!(validate_identifier("requester", "   ").is_err());
    }

    #[test]
    fn test_identifier_eq() {
        assert!(identifier_eq("Worker-1", "worker-1"));
        assert!(identifier_eq(" worker-1", "worker-1 "));
        assert!(!identifier_eq("worker-1", "worker-2"));
    }
}
