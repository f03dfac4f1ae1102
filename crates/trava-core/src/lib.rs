//! Trava Core - Lock coordination
//!
//! This crate provides:
//! - The `LockProvider` coordinator contract
//! - `AcquiredLockHandle` with its expiry/keep-alive controller
//! - The in-process strategy (`LocalLockProvider`)
//! - The cross-process strategy (`DatabaseLockProvider`) and its
//!   reconciliation workers
//! - The `TaskScheduler` collaborator used for background loops

pub mod service;

// Re-exports for convenience
pub use service::distributed::DatabaseLockProvider;
pub use service::handle::AcquiredLockHandle;
pub use service::local::LocalLockProvider;
pub use service::provider::{AcquireOptions, LockProvider};
pub use service::scheduler::{RepeatingJob, TaskScheduler, TokioScheduler};
