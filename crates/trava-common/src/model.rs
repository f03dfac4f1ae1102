//! Lock coordination data model
//!
//! One `ResourceLockState` exists per distinct resource key (case-insensitive
//! string). Pending requests are ordered per resource by creation time and
//! resolve exactly once. All timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};

use crate::utils::{current_timestamp, identifier_eq, normalize_resource};

/// Snapshot of one resource's lock state.
///
/// At most one non-null `holder` exists at any instant; `expiry_date` is only
/// meaningful while `holder` is set (`None` = the current hold never expires).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLockState {
    /// Canonical resource key (immutable identity, lower-cased).
    pub resource: String,
    /// Current owner, if any.
    #[serde(default)]
    pub holder: Option<String>,
    /// When the current holder acquired the lock (Unix millis).
    #[serde(default)]
    pub locked_at: Option<i64>,
    /// Last time the resource transitioned to held; used for inactivity cleanup.
    #[serde(default)]
    pub last_lock_date: Option<i64>,
    /// When the current hold expires (Unix millis, `None` = never).
    #[serde(default)]
    pub expiry_date: Option<i64>,
    /// Number of queued acquire requests (derived).
    #[serde(default)]
    pub pending_request_count: u64,
}

impl ResourceLockState {
    /// Synthetic free/default state for an unknown resource.
    pub fn free(resource: &str) -> Self {
        Self {
            resource: normalize_resource(resource),
            holder: None,
            locked_at: None,
            last_lock_date: None,
            expiry_date: None,
            pending_request_count: 0,
        }
    }

    /// Whether the current hold has expired at `now`.
    ///
    /// A free resource or a hold without expiry never counts as expired.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.holder.is_some() && self.expiry_date.is_some_and(|e| now >= e)
    }

    /// Whether the current hold has expired at the current wall-clock time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    /// Whether `requester` currently holds this resource (case-insensitive,
    /// expired holds do not count).
    pub fn is_held_by(&self, requester: &str) -> bool {
        !self.is_expired()
            && self
                .holder
                .as_deref()
                .is_some_and(|h| identifier_eq(h, requester))
    }

    /// Whether the resource can be granted right now (free or expired hold).
    pub fn is_grantable(&self, now: i64) -> bool {
        self.holder.is_none() || self.is_expired_at(now)
    }
}

/// Snapshot of a queued, not-yet-granted acquire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequestInfo {
    /// Opaque request id: store-assigned row id for the cross-process
    /// strategy, a process-local sequence number for the in-process one.
    pub id: i64,
    pub resource: String,
    pub requester: String,
    /// Expiry the request asked for, in milliseconds (`None` = no expiry).
    #[serde(default)]
    pub requested_expiry_ms: Option<i64>,
    #[serde(default)]
    pub keep_alive: bool,
    /// Absolute wait deadline (Unix millis, `None` = waits forever).
    #[serde(default)]
    pub timeout_time: Option<i64>,
    pub created_time: i64,
}

impl PendingRequestInfo {
    /// Whether the request's wait deadline has passed at `now`.
    pub fn is_timed_out_at(&self, now: i64) -> bool {
        self.timeout_time.is_some_and(|t| now >= t)
    }
}

/// A request row to persist (cross-process strategy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLockRequest {
    pub resource: String,
    pub requester: String,
    pub requested_expiry_ms: Option<i64>,
    pub keep_alive: bool,
    pub timeout_time: Option<i64>,
    pub created_time: i64,
}

/// Fields a lock query can sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSortField {
    Resource,
    Holder,
    LockedAt,
    LastLockDate,
    ExpiryDate,
    PendingRequestCount,
}

/// One sort key; keys earlier in the list take priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: LockSortField,
    #[serde(default)]
    pub descending: bool,
}

/// Expiry-state filter; the two options are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryFilter {
    /// Only resources whose hold has an expiry that already passed.
    OnlyExpired,
    /// Only resources whose hold has an expiry still in the future.
    OnlyNotExpired,
}

/// Composed, order-independent query filters, ANDed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryCriteria {
    /// Case-insensitive substring match on the resource key.
    #[serde(default)]
    pub resource_contains: Option<String>,
    /// Case-insensitive substring match on the holder.
    #[serde(default)]
    pub holder_contains: Option<String>,
    /// Exact-equality match on the holder. Outer `None` = no filter;
    /// `Some(None)` matches only unheld resources.
    #[serde(default)]
    pub holder_equals: Option<Option<String>>,
    /// Only resources with strictly more pending requests than this.
    #[serde(default)]
    pub pending_requests_greater_than: Option<u64>,
    #[serde(default)]
    pub expiry: Option<ExpiryFilter>,
    /// Sort keys applied as a stable, lexicographically prioritized sort.
    #[serde(default)]
    pub sort: Vec<SortKey>,
    /// 1-based page number; `<= 0` disables pagination.
    #[serde(default)]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page_size() -> u64 {
    100
}

impl QueryCriteria {
    pub fn new() -> Self {
        Self {
            page_size: default_page_size(),
            ..Default::default()
        }
    }

    pub fn resource_contains(mut self, fragment: impl Into<String>) -> Self {
        self.resource_contains = Some(fragment.into());
        self
    }

    pub fn holder_contains(mut self, fragment: impl Into<String>) -> Self {
        self.holder_contains = Some(fragment.into());
        self
    }

    /// Filter on exact holder; `None` matches only unheld resources.
    pub fn holder_equals(mut self, holder: Option<String>) -> Self {
        self.holder_equals = Some(holder);
        self
    }

    pub fn pending_requests_greater_than(mut self, threshold: u64) -> Self {
        self.pending_requests_greater_than = Some(threshold);
        self
    }

    /// The expiry filters are mutually exclusive; setting one replaces the other.
    pub fn only_expired(mut self) -> Self {
        self.expiry = Some(ExpiryFilter::OnlyExpired);
        self
    }

    pub fn only_not_expired(mut self) -> Self {
        self.expiry = Some(ExpiryFilter::OnlyNotExpired);
        self
    }

    pub fn order_by(mut self, field: LockSortField, descending: bool) -> Self {
        self.sort.push(SortKey { field, descending });
        self
    }

    pub fn paged(mut self, page: i64, page_size: u64) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }
}

/// One page of query results plus the true total matching count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page<T> {
    pub total_count: u64,
    pub page_number: u64,
    pub pages_available: u64,
    pub page_items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(total_count: u64, page_number: u64, page_size: u64, page_items: Vec<T>) -> Self {
        Self {
            total_count,
            page_number,
            pages_available: if page_size > 0 {
                (total_count as f64 / page_size as f64).ceil() as u64
            } else {
                0
            },
            page_items,
        }
    }

    /// A single unpaginated page holding every match.
    pub fn all(page_items: Vec<T>) -> Self {
        let total = page_items.len() as u64;
        Self {
            total_count: total,
            page_number: 1,
            pages_available: 1,
            page_items,
        }
    }
}

/// Cleanup policy for inactive, unheld, request-free lock records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Keep all records.
    Disabled,
    /// Remove records whose last lock activity is older than `max_age_ms`.
    Time { max_age_ms: i64 },
    /// Remove inactive records once the total exceeds `max_records`.
    Count { max_records: u64 },
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::Time {
            max_age_ms: default_cleanup_max_age_ms(),
        }
    }
}

fn default_cleanup_max_age_ms() -> i64 {
    24 * 60 * 60 * 1000 // one day
}

/// Recognized configuration options for both lock strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManagerConfig {
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
    /// How often the maintenance worker evaluates the cleanup policy.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Whether stale-lock operations raise `LockError::Stale` or fail
    /// silently by returning `false`.
    #[serde(default)]
    pub throw_on_stale_lock: bool,
    /// How far before the current expiry a keep-alive handle renews.
    #[serde(default = "default_renewal_offset_ms")]
    pub renewal_offset_ms: u64,
    /// Fixed extension applied by each keep-alive renewal.
    #[serde(default = "default_keep_alive_extension_ms")]
    pub keep_alive_extension_ms: u64,
    /// Poll interval of the cross-process reconciliation workers.
    #[serde(default = "default_request_poll_interval_ms")]
    pub request_poll_interval_ms: u64,
    /// Bounded batch size used by the reconciliation workers.
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: usize,
    /// Deadline for background work to drain during shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_renewal_offset_ms() -> u64 {
    2_000
}

fn default_keep_alive_extension_ms() -> u64 {
    30_000
}

fn default_request_poll_interval_ms() -> u64 {
    1_000
}

fn default_reconcile_batch_size() -> usize {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_policy: CleanupPolicy::default(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            throw_on_stale_lock: false,
            renewal_offset_ms: default_renewal_offset_ms(),
            keep_alive_extension_ms: default_keep_alive_extension_ms(),
            request_poll_interval_ms: default_request_poll_interval_ms(),
            reconcile_batch_size: default_reconcile_batch_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}
