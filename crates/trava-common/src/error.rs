//! Error types for Trava
//!
//! This module defines:
//! - `LockError`: the caller-facing error taxonomy
//! - `StaleLockKind`: why a stale-lock operation was rejected

use std::time::Duration;

use crate::model::ResourceLockState;

/// Why an operation on a previously acquired handle is stale.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StaleLockKind {
    /// Nobody holds the resource anymore.
    #[error("the resource is no longer held")]
    NotHeld,
    /// The resource has since been taken by another holder.
    #[error("the resource is now held by '{0}'")]
    HeldByOther(String),
}

/// Lock coordination errors.
///
/// Validation errors are surfaced immediately and never retried. Stale-lock
/// conditions are recoverable by design: whether they raise or surface as a
/// boolean `false` is controlled by `LockManagerConfig::throw_on_stale_lock`.
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A queued acquire exceeded its configured timeout. Carries the lock
    /// snapshot observed when the timeout fired.
    #[error(
        "timed out after {timeout:?} waiting for lock on '{}' (requester '{requester}')",
        state.resource
    )]
    Timeout {
        state: Box<ResourceLockState>,
        requester: String,
        timeout: Duration,
    },

    /// The caller's cancellation signal fired, or the request was removed
    /// out-of-band before it could be granted.
    #[error("lock request was cancelled")]
    Cancelled,

    #[error("stale lock: {0}")]
    Stale(StaleLockKind),

    /// The provider has been shut down.
    #[error("lock provider is disposed")]
    Disposed,

    /// Several independent failures collected during shutdown.
    #[error("{} error(s) occurred during shutdown", .0.len())]
    Aggregate(Vec<LockError>),

    /// Backing store failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LockError {
    /// Fold a list of failures into a single error: zero failures is `Ok`,
    /// one failure is returned as-is, several are aggregated.
    pub fn aggregate(mut errors: Vec<LockError>) -> Result<(), LockError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(LockError::Aggregate(errors)),
        }
    }

    /// Whether this error means the provider is no longer usable.
    pub fn is_disposed(&self) -> bool {
        matches!(self, LockError::Disposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(LockError::aggregate(Vec::new()).is_ok());
    }

    #[test]
    fn test_aggregate_single_passes_through() {
        let err = LockError::aggregate(vec![LockError::Disposed]).unwrap_err();
        assert!(matches!(err, LockError::Disposed));
    }

    #[test]
    fn test_aggregate_many_wraps() {
        let err = LockError::aggregate(vec![LockError::Disposed, LockError::Cancelled])
            .unwrap_err();
        match err {
            LockError::Aggregate(inner) => assert_eq!(inner.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_display_names_resource_and_requester() {
        let err = LockError::Timeout {
            state: Box::new(ResourceLockState::free("jobs.nightly")),
            requester: "worker-9".to_string(),
            timeout: Duration::from_secs(1),
        };
        let text = err.to_string();
        assert!(text.contains("jobs.nightly"));
        assert!(text.contains("worker-9"));
    }

    #[test]
    fn test_stale_kind_display() {
        assert_eq!(
            LockError::Stale(StaleLockKind::HeldByOther("other".into())).to_string(),
            "stale lock: the resource is now held by 'other'"
        );
    }
}
