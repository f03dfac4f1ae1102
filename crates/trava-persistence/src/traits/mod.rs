//! Storage collaborator contract for the cross-process lock strategy
//!
//! The coordinator never talks SQL directly: every store round-trip goes
//! through `LockPersistence`. The contract is transactional where it has to
//! be — assignment, unlock and extension each happen under the store's own
//! row-locking semantics so that only one process wins a race.

use async_trait::async_trait;

use trava_common::model::{NewLockRequest, Page, PendingRequestInfo, QueryCriteria, ResourceLockState};

/// Lock store operations consumed by the cross-process strategy.
///
/// All `resource` arguments are expected in canonical (lower-cased) form;
/// holder/requester comparisons are case-insensitive.
#[async_trait]
pub trait LockPersistence: Send + Sync {
    /// Fetch a resource's current state; `None` for unknown resources.
    ///
    /// When `include_pending` is set the snapshot carries the derived
    /// pending-request count, otherwise it is reported as zero.
    async fn get_state(
        &self,
        resource: &str,
        include_pending: bool,
    ) -> anyhow::Result<Option<ResourceLockState>>;

    /// Transactionally attempt to grant `resource` to `requester`.
    ///
    /// Succeeds when the row is free, its hold has expired, or `requester`
    /// already holds it (pure renewal). A pending request from any other
    /// requester blocks a direct grant so the queue keeps its priority.
    /// Returns the post-grant snapshot, or `None` when not granted.
    async fn try_assign(
        &self,
        resource: &str,
        requester: &str,
        expiry_ms: Option<i64>,
    ) -> anyhow::Result<Option<ResourceLockState>>;

    /// Transactionally release `resource` if still held by `holder`.
    async fn unlock_if_held(&self, resource: &str, holder: &str) -> anyhow::Result<bool>;

    /// Transactionally extend (or initialize) the expiry of a hold.
    ///
    /// Returns the new expiry instant, or `None` when `holder` no longer
    /// holds the resource.
    async fn try_extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> anyhow::Result<Option<i64>>;

    /// Persist a pending request row; returns the store-assigned id.
    async fn insert_request(&self, request: NewLockRequest) -> anyhow::Result<i64>;

    /// Delete request rows by id; returns how many were removed.
    async fn delete_requests(&self, ids: &[i64]) -> anyhow::Result<u64>;

    /// All pending requests for one resource, oldest first.
    async fn requests_for_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Vec<PendingRequestInfo>>;

    /// Fetch a batch of requests by id (missing ids are simply absent).
    async fn requests_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<PendingRequestInfo>>;

    /// Which of the given request ids no longer exist in the store.
    async fn deleted_request_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>>;

    /// Distinct resources that currently have outstanding requests,
    /// bounded by `limit`.
    async fn resources_with_pending_requests(&self, limit: usize) -> anyhow::Result<Vec<String>>;

    /// Transactionally run the assignment algorithm for one resource:
    /// drop timed-out requests, and if the resource is free or expired,
    /// grant the oldest eligible request and delete rows it supersedes.
    /// Returns the new snapshot when anything changed.
    async fn reconcile_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Option<ResourceLockState>>;

    /// Administrative override: clear the holder and optionally delete all
    /// pending request rows for the resource.
    async fn force_release(&self, resource: &str, remove_requests: bool) -> anyhow::Result<()>;

    /// Filter/sort/paginate lock snapshots; the returned page always carries
    /// the true total matching count.
    async fn search(&self, criteria: &QueryCriteria) -> anyhow::Result<Page<ResourceLockState>>;

    /// Delete inactive, unheld, request-free lock rows. With `older_than_ms`
    /// only rows whose last lock activity is older than that age go away;
    /// with `None` every inactive row does. Returns how many were removed.
    async fn delete_inactive(&self, older_than_ms: Option<i64>) -> anyhow::Result<u64>;

    /// Total number of lock rows.
    async fn count_locks(&self) -> anyhow::Result<u64>;
}
