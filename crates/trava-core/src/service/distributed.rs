//! Cross-process lock strategy
//!
//! All shared state lives in the transactional store behind
//! `LockPersistence`; this module only keeps the local waiters. Three
//! repeating workers reconcile the store with the waiters:
//!
//! - assignment: runs the assignment algorithm for every resource that has
//!   outstanding request rows
//! - completion: watches the request rows of local waiters; a deleted row
//!   means the request was resolved (granted, or removed out-of-band)
//! - maintenance: applies the cleanup policy to inactive lock rows
//!
//! Release and expiry additionally trigger an inline reconcile pass so a
//! handover inside one process does not wait for the next poll tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use trava_common::error::{LockError, StaleLockKind};
use trava_common::model::{
    CleanupPolicy, LockManagerConfig, NewLockRequest, Page, PendingRequestInfo, QueryCriteria,
    ResourceLockState,
};
use trava_common::utils::{current_timestamp, normalize_resource, validate_identifier};
use trava_persistence::LockPersistence;

use super::handle::{
    AcquiredLockHandle, ExtendOutcome, HandleDriver, ReleaseOutcome, stale_kind,
};
use super::provider::{AcquireOptions, LockProvider};
use super::scheduler::{TaskScheduler, TokioScheduler, wait_for_stop};

type GrantSender = oneshot::Sender<Result<AcquiredLockHandle, LockError>>;

/// A local waiter whose request row is in the store.
struct DbPending {
    resource: String,
    requester: String,
    requested_keep_alive: bool,
    tx: GrantSender,
}

struct DbInner {
    self_ref: Weak<DbInner>,
    store: Arc<dyn LockPersistence>,
    config: Arc<LockManagerConfig>,
    /// Local waiters keyed by their store-assigned request row id.
    pending: DashMap<i64, DbPending>,
    disposed: AtomicBool,
    shutdown: watch::Sender<bool>,
    scheduler: TokioScheduler,
}

/// Cross-process Lock Coordinator backed by a transactional store.
pub struct DatabaseLockProvider {
    inner: Arc<DbInner>,
}

impl DatabaseLockProvider {
    pub fn new(store: Arc<dyn LockPersistence>, config: LockManagerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| DbInner {
            self_ref: self_ref.clone(),
            store,
            config: Arc::new(config),
            pending: DashMap::new(),
            disposed: AtomicBool::new(false),
            shutdown,
            scheduler: TokioScheduler::new(),
        });
        inner.start_workers();
        Self { inner }
    }
}

impl DbInner {
    fn start_workers(self: &Arc<Self>) {
        let poll = Duration::from_millis(self.config.request_poll_interval_ms);
        self.schedule("lock-assignment", poll, poll, |inner| async move {
            run_assignment_cycle(&inner).await
        });
        self.schedule("lock-completion", poll, poll, |inner| async move {
            run_completion_cycle(&inner).await
        });
        if !matches!(self.config.cleanup_policy, CleanupPolicy::Disabled) {
            let interval = Duration::from_millis(self.config.cleanup_interval_ms);
            self.schedule("lock-maintenance", interval, interval, |inner| async move {
                run_maintenance_cycle(&inner).await
            });
        }
    }

    fn schedule<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        cycle: F,
    ) where
        F: Fn(Arc<DbInner>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let weak = self.self_ref.clone();
        let cycle = Arc::new(cycle);
        self.scheduler.schedule_repeating(
            name,
            initial_delay,
            interval,
            Arc::new(move || {
                let weak = weak.clone();
                let cycle = cycle.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => cycle(inner).await,
                        None => Ok(()),
                    }
                })
            }),
        );
    }

    fn ensure_open(&self) -> Result<(), LockError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(LockError::Disposed)
        } else {
            Ok(())
        }
    }

    fn make_handle(&self, state: &ResourceLockState, requester: &str, keep_alive: bool) -> AcquiredLockHandle {
        AcquiredLockHandle::new(
            state.resource.clone(),
            requester.to_string(),
            state.locked_at,
            state.last_lock_date,
            state.expiry_date,
            keep_alive,
            Arc::new(DbDriver {
                inner: self.self_ref.clone(),
            }),
            self.config.clone(),
            self.shutdown.subscribe(),
        )
    }

    async fn peek_state(&self, key: &str) -> Result<ResourceLockState, LockError> {
        Ok(self
            .store
            .get_state(key, true)
            .await?
            .unwrap_or_else(|| ResourceLockState::free(key)))
    }

    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: &AcquireOptions,
    ) -> Result<Option<AcquiredLockHandle>, LockError> {
        self.ensure_open()?;
        validate_identifier("resource", resource)?;
        validate_identifier("requester", requester)?;
        let key = normalize_resource(resource);
        let expiry_ms = opts.expiry.map(|e| e.as_millis() as i64);
        let granted = self.store.try_assign(&key, requester, expiry_ms).await?;
        Ok(granted.map(|state| {
            debug!(resource = %key, holder = %requester, "lock granted");
            self.make_handle(&state, requester, opts.keep_alive)
        }))
    }

    async fn acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: AcquireOptions,
    ) -> Result<AcquiredLockHandle, LockError> {
        if let Some(handle) = self.try_acquire(resource, requester, &opts).await? {
            return Ok(handle);
        }
        let key = normalize_resource(resource);
        let now = current_timestamp();
        let timeout_time = opts.timeout.map(|t| now + t.as_millis() as i64);
        let request_id = self
            .store
            .insert_request(NewLockRequest {
                resource: key.clone(),
                requester: requester.to_string(),
                requested_expiry_ms: opts.expiry.map(|e| e.as_millis() as i64),
                keep_alive: opts.keep_alive,
                timeout_time,
                created_time: now,
            })
            .await?;
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            DbPending {
                resource: key.clone(),
                requester: requester.to_string(),
                requested_keep_alive: opts.keep_alive,
                tx,
            },
        );
        // Inline pass so an already-free resource resolves without waiting
        // for the next poll tick.
        if let Some(inner) = self.self_ref.upgrade() {
            let _ = self.store.reconcile_resource(&key).await;
            let _ = run_completion_cycle(&inner).await;
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let timeout = opts.timeout;
        let mut cancel = opts.cancel;
        tokio::select! {
            granted = &mut rx => {
                match granted {
                    Ok(outcome) => outcome,
                    Err(_) => Err(LockError::Cancelled),
                }
            }
            _ = sleep_until_opt(timeout_time) => {
                if let Some(handle) = drain_grant(&mut rx) {
                    return Ok(handle);
                }
                self.abandon_request(&key, request_id).await;
                let state = self.peek_state(&key).await.unwrap_or_else(|_| ResourceLockState::free(&key));
                Err(LockError::Timeout {
                    state: Box::new(state),
                    requester: requester.to_string(),
                    timeout: timeout.unwrap_or_default(),
                })
            }
            _ = wait_for_signal(&mut cancel) => {
                if let Some(mut handle) = drain_grant(&mut rx) {
                    let _ = handle.release().await;
                }
                self.abandon_request(&key, request_id).await;
                Err(LockError::Cancelled)
            }
            _ = wait_for_stop(&mut shutdown_rx) => {
                if let Some(mut handle) = drain_grant(&mut rx) {
                    let _ = handle.release().await;
                }
                self.abandon_request(&key, request_id).await;
                Err(LockError::Disposed)
            }
        }
    }

    /// Remove a request both locally and from the store after its waiter
    /// stopped waiting.
    async fn abandon_request(&self, resource: &str, request_id: i64) {
        self.pending.remove(&request_id);
        if let Err(e) = self.store.delete_requests(&[request_id]).await {
            warn!(resource, request_id, error = %e, "failed to delete abandoned lock request");
        }
    }

    async fn shutdown(&self) -> Result<(), LockError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down cross-process lock provider");
        let _ = self.shutdown.send(true);
        let mut errors = Vec::new();
        if let Err(e) = self
            .scheduler
            .cancel_all(Duration::from_millis(self.config.shutdown_grace_ms))
            .await
        {
            match e {
                LockError::Aggregate(inner) => errors.extend(inner),
                other => errors.push(other),
            }
        }
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.tx.send(Err(LockError::Disposed));
                if let Err(e) = self.store.delete_requests(&[id]).await {
                    errors.push(LockError::Store(e));
                }
            }
        }
        LockError::aggregate(errors)
    }
}

/// Run the assignment algorithm for every resource with outstanding
/// request rows, bounded by the configured batch size.
async fn run_assignment_cycle(inner: &Arc<DbInner>) -> anyhow::Result<()> {
    let resources = inner
        .store
        .resources_with_pending_requests(inner.config.reconcile_batch_size)
        .await?;
    let results = join_all(
        resources
            .iter()
            .map(|resource| inner.store.reconcile_resource(resource)),
    )
    .await;
    for (resource, result) in resources.iter().zip(results) {
        if let Err(e) = result {
            warn!(resource, error = %e, "assignment reconcile failed");
        }
    }
    Ok(())
}

/// Resolve local waiters whose request rows have disappeared from the
/// store: granted when the waiter now holds the resource, cancelled when
/// the row was removed out-of-band.
async fn run_completion_cycle(inner: &Arc<DbInner>) -> anyhow::Result<()> {
    let ids: Vec<i64> = inner.pending.iter().map(|e| *e.key()).collect();
    if ids.is_empty() {
        return Ok(());
    }
    let mut deleted = Vec::new();
    // The store is asked in bounded batches so a large backlog never turns
    // into one oversized query.
    for chunk in ids.chunks(inner.config.reconcile_batch_size.max(1)) {
        deleted.extend(inner.store.deleted_request_ids(chunk).await?);
    }
    for id in deleted {
        let Some((_, waiter)) = inner.pending.remove(&id) else {
            continue;
        };
        let state = match inner.store.get_state(&waiter.resource, false).await {
            Ok(state) => state,
            Err(e) => {
                let _ = waiter.tx.send(Err(LockError::Store(e)));
                continue;
            }
        };
        match state {
            Some(state) if state.is_held_by(&waiter.requester) => {
                let handle =
                    inner.make_handle(&state, &waiter.requester, waiter.requested_keep_alive);
                if let Err(Ok(handle)) = waiter.tx.send(Ok(handle)) {
                    // Waiter gone between grant and delivery: give the
                    // resource back so the queue moves on.
                    handle.abandon();
                    let _ = inner
                        .store
                        .unlock_if_held(&waiter.resource, &waiter.requester)
                        .await;
                    let _ = inner.store.reconcile_resource(&waiter.resource).await;
                }
            }
            _ => {
                // Row deleted without a grant: removed out-of-band.
                let _ = waiter.tx.send(Err(LockError::Cancelled));
            }
        }
    }
    Ok(())
}

/// Apply the cleanup policy to inactive lock rows.
async fn run_maintenance_cycle(inner: &Arc<DbInner>) -> anyhow::Result<()> {
    match inner.config.cleanup_policy {
        CleanupPolicy::Disabled => {}
        CleanupPolicy::Time { max_age_ms } => {
            let removed = inner.store.delete_inactive(Some(max_age_ms)).await?;
            if removed > 0 {
                debug!(removed, "maintenance removed inactive lock rows");
            }
        }
        CleanupPolicy::Count { max_records } => {
            if inner.store.count_locks().await? > max_records {
                let removed = inner.store.delete_inactive(None).await?;
                debug!(removed, "maintenance removed inactive lock rows");
            }
        }
    }
    Ok(())
}

fn drain_grant(
    rx: &mut oneshot::Receiver<Result<AcquiredLockHandle, LockError>>,
) -> Option<AcquiredLockHandle> {
    rx.close();
    match rx.try_recv() {
        Ok(Ok(handle)) => Some(handle),
        _ => None,
    }
}

async fn sleep_until_opt(deadline: Option<i64>) {
    match deadline {
        Some(at) => {
            let wait = (at - current_timestamp()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_for_signal(signal: &mut Option<watch::Receiver<bool>>) {
    match signal {
        Some(rx) => {
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
        None => std::future::pending().await,
    }
}

struct DbDriver {
    inner: Weak<DbInner>,
}

impl DbDriver {
    fn upgrade(&self) -> Result<Arc<DbInner>, LockError> {
        self.inner.upgrade().ok_or(LockError::Disposed)
    }
}

async fn stale_state_kind(
    store: &Arc<dyn LockPersistence>,
    resource: &str,
) -> StaleLockKind {
    match store.get_state(resource, false).await {
        Ok(Some(state)) if !state.is_expired() => stale_kind(state.holder.as_deref()),
        _ => StaleLockKind::NotHeld,
    }
}

#[async_trait]
impl HandleDriver for DbDriver {
    async fn extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> Result<ExtendOutcome, LockError> {
        let inner = self.upgrade()?;
        inner.ensure_open()?;
        match inner.store.try_extend(resource, holder, extend_ms).await? {
            Some(new_expiry) => Ok(ExtendOutcome::Extended(new_expiry)),
            None => Ok(ExtendOutcome::Stale(
                stale_state_kind(&inner.store, resource).await,
            )),
        }
    }

    async fn unlock(&self, resource: &str, holder: &str) -> Result<ReleaseOutcome, LockError> {
        let inner = self.upgrade()?;
        if inner.store.unlock_if_held(resource, holder).await? {
            debug!(resource, holder, "lock released");
            // Hand over to the queue without waiting for the next poll.
            let _ = inner.store.reconcile_resource(resource).await;
            let _ = run_completion_cycle(&inner).await;
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::Stale(
                stale_state_kind(&inner.store, resource).await,
            ))
        }
    }

    async fn resource_expired(&self, resource: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = inner.store.reconcile_resource(resource).await {
            warn!(resource, error = %e, "expiry reconcile failed");
            return;
        }
        let _ = run_completion_cycle(&inner).await;
    }

    async fn is_held_by(&self, resource: &str, holder: &str) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        match inner.store.get_state(resource, false).await {
            Ok(Some(state)) => state.is_held_by(holder),
            _ => false,
        }
    }
}

#[async_trait]
impl LockProvider for DatabaseLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: AcquireOptions,
    ) -> Result<Option<AcquiredLockHandle>, LockError> {
        self.inner.try_acquire(resource, requester, &opts).await
    }

    async fn acquire(
        &self,
        resource: &str,
        requester: &str,
        opts: AcquireOptions,
    ) -> Result<AcquiredLockHandle, LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        validate_identifier("requester", requester)?;
        self.inner.acquire(resource, requester, opts).await
    }

    async fn get(&self, resource: &str) -> Result<ResourceLockState, LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        self.inner.peek_state(&normalize_resource(resource)).await
    }

    async fn get_pending_requests(
        &self,
        resource: &str,
    ) -> Result<Vec<PendingRequestInfo>, LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        let key = normalize_resource(resource);
        Ok(self.inner.store.requests_for_resource(&key).await?)
    }

    async fn query(&self, criteria: QueryCriteria) -> Result<Page<ResourceLockState>, LockError> {
        self.inner.ensure_open()?;
        Ok(self.inner.store.search(&criteria).await?)
    }

    async fn force_release(
        &self,
        resource: &str,
        remove_pending_requests: bool,
    ) -> Result<(), LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        let key = normalize_resource(resource);
        info!(resource = %key, remove_pending_requests, "force releasing lock");
        self.inner
            .store
            .force_release(&key, remove_pending_requests)
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), LockError> {
        self.inner.shutdown().await
    }
}
