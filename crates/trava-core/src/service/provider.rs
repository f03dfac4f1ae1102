//! Lock Coordinator contract
//!
//! The provider surface shared by both strategies. `acquire` is the only
//! operation that may suspend the caller; everything else completes after at
//! most one store round-trip.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use trava_common::error::LockError;
use trava_common::model::{Page, PendingRequestInfo, QueryCriteria, ResourceLockState};

use super::handle::AcquiredLockHandle;

/// Options for `try_acquire`/`acquire`.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// How long the hold lasts before expiring (`None` = never expires).
    pub expiry: Option<Duration>,
    /// Automatically renew the expiry until the handle is released.
    pub keep_alive: bool,
    /// Maximum time `acquire` waits in the queue (`None` = waits forever).
    /// Ignored by `try_acquire`.
    pub timeout: Option<Duration>,
    /// Caller-supplied cancellation signal: the wait aborts with
    /// `LockError::Cancelled` once the watched value turns `true`.
    /// Ignored by `try_acquire`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Lock Coordinator: grants exclusive ownership of named resources.
///
/// Fairness applies to both strategies: a resource is granted to requester X
/// when it has no holder, its expiry has passed, or X already holds it (pure
/// renewal). In the first two cases a non-empty pending queue is serviced
/// head-first, even ahead of the caller whose call observed the transition;
/// only a same-holder renewal bypasses the queue.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Attempt to acquire without waiting. Returns `None` when the resource
    /// is not grantable to this requester right now.
    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: AcquireOptions,
    ) -> Result<Option<AcquiredLockHandle>, LockError>;

    /// Acquire the resource, waiting in the fair queue if necessary.
    ///
    /// Suspends until granted, timed out (`LockError::Timeout`), cancelled
    /// (`LockError::Cancelled`) or the provider shuts down
    /// (`LockError::Disposed`). Resolves synchronously when immediately free.
    async fn acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: AcquireOptions,
    ) -> Result<AcquiredLockHandle, LockError>;

    /// Snapshot of a resource's state; unknown resources yield a synthetic
    /// free state rather than failing.
    async fn get(&self, resource: &str) -> Result<ResourceLockState, LockError>;

    /// Pending requests for a resource, oldest first.
    async fn get_pending_requests(
        &self,
        resource: &str,
    ) -> Result<Vec<PendingRequestInfo>, LockError>;

    /// Filter/sort/paginate lock snapshots; the page carries the true total
    /// matching count.
    async fn query(&self, criteria: QueryCriteria) -> Result<Page<ResourceLockState>, LockError>;

    /// Administrative override: clear the holder and optionally drop the
    /// pending queue. Kept requests stay queued and are serviced on the next
    /// normal resolution cycle.
    async fn force_release(
        &self,
        resource: &str,
        remove_pending_requests: bool,
    ) -> Result<(), LockError>;

    /// Stop all background work and resolve every still-pending request with
    /// a disposed error. Idempotent; failures encountered along the way are
    /// aggregated rather than lost.
    async fn shutdown(&self) -> Result<(), LockError>;
}
