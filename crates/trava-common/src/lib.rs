//! Trava Common - Shared types for the lock coordination library
//!
//! This crate provides the foundational types used by both lock strategies:
//! - Error taxonomy (`LockError`)
//! - Lock state and pending request model
//! - Query criteria and the snapshot query engine
//! - Configuration surface
//! - Utility functions

pub mod error;
pub mod model;
pub mod query;
pub mod utils;

// Re-exports for convenience
pub use error::{LockError, StaleLockKind};
pub use model::{
    CleanupPolicy, ExpiryFilter, LockManagerConfig, LockSortField, NewLockRequest, Page,
    PendingRequestInfo, QueryCriteria, ResourceLockState, SortKey,
};
pub use utils::{current_timestamp, normalize_resource, validate_identifier};
