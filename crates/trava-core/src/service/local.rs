//! In-process lock strategy
//!
//! One slot per resource key, each guarded by its own async mutex. Pending
//! requests wait on oneshot channels in per-slot FIFO queues; every queue
//! mutation happens with the slot lock held, so resolution order is exactly
//! arrival order. Slots eligible for cleanup are retired under their own lock
//! before removal, so a task still holding an old slot handle can detect the
//! retirement and re-enter through the map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot, watch};
use tracing::{debug, info};

use trava_common::error::{LockError, StaleLockKind};
use trava_common::model::{
    CleanupPolicy, LockManagerConfig, Page, PendingRequestInfo, QueryCriteria, ResourceLockState,
};
use trava_common::query;
use trava_common::utils::{current_timestamp, normalize_resource, validate_identifier};

use super::handle::{
    AcquiredLockHandle, ExtendOutcome, HandleDriver, ReleaseOutcome, stale_kind,
};
use super::provider::{AcquireOptions, LockProvider};
use super::scheduler::{TaskScheduler, TokioScheduler, wait_for_stop};

type GrantSender = oneshot::Sender<Result<AcquiredLockHandle, LockError>>;

struct LocalWaiter {
    info: PendingRequestInfo,
    tx: GrantSender,
}

struct ResourceSlot {
    state: ResourceLockState,
    queue: VecDeque<LocalWaiter>,
    /// Set under the slot lock just before the slot is removed from the map.
    retired: bool,
}

impl ResourceSlot {
    fn new(resource: &str) -> Self {
        Self {
            state: ResourceLockState::free(resource),
            queue: VecDeque::new(),
            retired: false,
        }
    }

    fn snapshot(&self) -> ResourceLockState {
        ResourceLockState {
            pending_request_count: self.queue.len() as u64,
            ..self.state.clone()
        }
    }
}

struct LocalInner {
    self_ref: Weak<LocalInner>,
    config: Arc<LockManagerConfig>,
    slots: DashMap<String, Arc<Mutex<ResourceSlot>>>,
    next_request_id: AtomicI64,
    disposed: AtomicBool,
    shutdown: watch::Sender<bool>,
    scheduler: TokioScheduler,
}

/// In-process Lock Coordinator.
pub struct LocalLockProvider {
    inner: Arc<LocalInner>,
}

impl LocalLockProvider {
    pub fn new(config: LockManagerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|self_ref| LocalInner {
            self_ref: self_ref.clone(),
            config: Arc::new(config),
            slots: DashMap::new(),
            next_request_id: AtomicI64::new(1),
            disposed: AtomicBool::new(false),
            shutdown,
            scheduler: TokioScheduler::new(),
        });
        inner.start_cleanup();
        Self { inner }
    }
}

impl Default for LocalLockProvider {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl LocalInner {
    fn start_cleanup(self: &Arc<Self>) {
        if matches!(self.config.cleanup_policy, CleanupPolicy::Disabled) {
            return;
        }
        let interval = Duration::from_millis(self.config.cleanup_interval_ms);
        let weak = self.self_ref.clone();
        self.scheduler.schedule_repeating(
            "lock-cleanup",
            interval,
            interval,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_cleanup_cycle().await;
                    }
                    Ok(())
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

    /// Lock the slot for `key`, creating it when absent. Loops past retired
    /// slots so a concurrent cleanup never leaves the caller holding a slot
    /// that is no longer in the map.
    async fn slot_guard(&self, key: &str) -> OwnedMutexGuard<ResourceSlot> {
        loop {
            let slot = self
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ResourceSlot::new(key))))
                .clone();
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Lock the slot for `key` only if it already exists.
    async fn existing_slot_guard(&self, key: &str) -> Option<OwnedMutexGuard<ResourceSlot>> {
        loop {
            let slot = self.slots.get(key)?.clone();
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return Some(guard);
            }
        }
    }

    fn make_handle(
        &self,
        slot_state: &ResourceLockState,
        requester: &str,
        keep_alive: bool,
    ) -> AcquiredLockHandle {
        AcquiredLockHandle::new(
            slot_state.resource.clone(),
            requester.to_string(),
            slot_state.locked_at,
            slot_state.last_lock_date,
            slot_state.expiry_date,
            keep_alive,
            Arc::new(LocalDriver {
                inner: self.self_ref.clone(),
            }),
            self.config.clone(),
            self.shutdown.subscribe(),
        )
    }

    fn grant_locked(
        &self,
        slot: &mut ResourceSlot,
        requester: &str,
        expiry_ms: Option<i64>,
        keep_alive: bool,
        now: i64,
    ) -> AcquiredLockHandle {
        slot.state.holder = Some(requester.to_string());
        slot.state.locked_at = Some(now);
        slot.state.last_lock_date = Some(now);
        slot.state.expiry_date = expiry_ms.map(|ms| now + ms);
        debug!(resource = %slot.state.resource, holder = %requester, "lock granted");
        self.make_handle(&slot.state, requester, keep_alive)
    }

    /// Service the pending queue while the resource is grantable. Timed-out
    /// waiters are resolved with a timeout error; a waiter whose receiver is
    /// already gone has its grant rolled back and the next one is tried. When
    /// an expired hold is left with an empty queue, the hold is cleared.
    fn resolve_queue_locked(&self, slot: &mut ResourceSlot, now: i64) {
        loop {
            if !slot.state.is_grantable(now) {
                return;
            }
            let Some(waiter) = slot.queue.pop_front() else {
                if slot.state.is_expired_at(now) {
                    debug!(resource = %slot.state.resource, "expired hold cleared");
                    slot.state.holder = None;
                    slot.state.locked_at = None;
                    slot.state.expiry_date = None;
                }
                return;
            };
            if waiter.info.is_timed_out_at(now) {
                let waited = waiter
                    .info
                    .timeout_time
                    .map(|t| t - waiter.info.created_time)
                    .unwrap_or(0)
                    .max(0) as u64;
                let _ = waiter.tx.send(Err(LockError::Timeout {
                    state: Box::new(slot.snapshot()),
                    requester: waiter.info.requester,
                    timeout: Duration::from_millis(waited),
                }));
                continue;
            }
            let prev_holder = slot.state.holder.take();
            let prev_locked_at = slot.state.locked_at.take();
            let prev_last_lock = slot.state.last_lock_date;
            let prev_expiry = slot.state.expiry_date.take();
            let handle = self.grant_locked(
                slot,
                &waiter.info.requester,
                waiter.info.requested_expiry_ms,
                waiter.info.keep_alive,
                now,
            );
            if let Err(result) = waiter.tx.send(Ok(handle)) {
                // Receiver gone between dequeue and delivery: undo the grant.
                if let Ok(handle) = result {
                    handle.abandon();
                }
                slot.state.holder = prev_holder;
                slot.state.locked_at = prev_locked_at;
                slot.state.last_lock_date = prev_last_lock;
                slot.state.expiry_date = prev_expiry;
                continue;
            }
            return;
        }
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
        let mut slot = self.slot_guard(&key).await;
        let now = current_timestamp();
        let expiry_ms = opts.expiry.map(|e| e.as_millis() as i64);

        // Same-holder renewal bypasses the queue; the original locked_at is
        // kept.
        if slot.state.is_held_by(requester) {
            slot.state.last_lock_date = Some(now);
            slot.state.expiry_date = expiry_ms.map(|ms| now + ms);
            return Ok(Some(self.make_handle(&slot.state, requester, opts.keep_alive)));
        }

        self.resolve_queue_locked(&mut slot, now);
        if slot.state.is_grantable(now) && slot.queue.is_empty() {
            return Ok(Some(self.grant_locked(
                &mut slot,
                requester,
                expiry_ms,
                opts.keep_alive,
                now,
            )));
        }
        Ok(None)
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

        let (tx, mut rx) = oneshot::channel();
        let request_id;
        let timeout_time;
        {
            let mut slot = self.slot_guard(&key).await;
            // Re-check under the lock: the resource may have freed up since
            // the fast path observed it held. The queue is serviced first so
            // an already-waiting head is never passed over.
            let now = current_timestamp();
            self.resolve_queue_locked(&mut slot, now);
            if slot.state.is_grantable(now) && slot.queue.is_empty() {
                let expiry_ms = opts.expiry.map(|e| e.as_millis() as i64);
                return Ok(self.grant_locked(&mut slot, requester, expiry_ms, opts.keep_alive, now));
            }
            request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            timeout_time = opts.timeout.map(|t| now + t.as_millis() as i64);
            slot.queue.push_back(LocalWaiter {
                info: PendingRequestInfo {
                    id: request_id,
                    resource: key.clone(),
                    requester: requester.to_string(),
                    requested_expiry_ms: opts.expiry.map(|e| e.as_millis() as i64),
                    keep_alive: opts.keep_alive,
                    timeout_time,
                    created_time: now,
                },
                tx,
            });
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let timeout = opts.timeout;
        let mut cancel = opts.cancel;
        tokio::select! {
            granted = &mut rx => {
                match granted {
                    Ok(outcome) => outcome,
                    // Sender dropped without resolution: the request was
                    // removed out-of-band.
                    Err(_) => Err(LockError::Cancelled),
                }
            }
            _ = sleep_until_opt(timeout_time) => {
                if let Some(handle) = self.drain_grant(&mut rx) {
                    return Ok(handle);
                }
                self.remove_pending(&key, request_id).await;
                let state = self.peek_state(&key).await;
                Err(LockError::Timeout {
                    state: Box::new(state),
                    requester: requester.to_string(),
                    timeout: timeout.unwrap_or_default(),
                })
            }
            _ = wait_for_signal(&mut cancel) => {
                if let Some(mut handle) = self.drain_grant(&mut rx) {
                    let _ = handle.release().await;
                }
                self.remove_pending(&key, request_id).await;
                Err(LockError::Cancelled)
            }
            _ = wait_for_stop(&mut shutdown_rx) => {
                if let Some(mut handle) = self.drain_grant(&mut rx) {
                    let _ = handle.release().await;
                }
                self.remove_pending(&key, request_id).await;
                Err(LockError::Disposed)
            }
        }
    }

    /// Close the grant channel and collect a grant that raced the wakeup.
    fn drain_grant(
        &self,
        rx: &mut oneshot::Receiver<Result<AcquiredLockHandle, LockError>>,
    ) -> Option<AcquiredLockHandle> {
        rx.close();
        match rx.try_recv() {
            Ok(Ok(handle)) => Some(handle),
            _ => None,
        }
    }

    async fn remove_pending(&self, key: &str, request_id: i64) {
        if let Some(mut slot) = self.existing_slot_guard(key).await {
            slot.queue.retain(|w| w.info.id != request_id);
        }
    }

    async fn peek_state(&self, key: &str) -> ResourceLockState {
        match self.existing_slot_guard(key).await {
            Some(slot) => slot.snapshot(),
            None => ResourceLockState::free(key),
        }
    }

    fn all_slots(&self) -> Vec<(String, Arc<Mutex<ResourceSlot>>)> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    async fn query(&self, criteria: QueryCriteria) -> Page<ResourceLockState> {
        let mut items = Vec::new();
        for (_, slot) in self.all_slots() {
            let guard = slot.lock().await;
            if !guard.retired {
                items.push(guard.snapshot());
            }
        }
        query::apply(&criteria, items, current_timestamp())
    }

    async fn force_release(&self, resource: &str, remove_pending_requests: bool) {
        let key = normalize_resource(resource);
        let Some(mut slot) = self.existing_slot_guard(&key).await else {
            return;
        };
        info!(resource = %key, remove_pending_requests, "force releasing lock");
        slot.state.holder = None;
        slot.state.locked_at = None;
        slot.state.expiry_date = None;
        if remove_pending_requests {
            for waiter in slot.queue.drain(..) {
                let _ = waiter.tx.send(Err(LockError::Cancelled));
            }
        }
    }

    async fn run_cleanup_cycle(&self) {
        let now = current_timestamp();
        match self.config.cleanup_policy {
            CleanupPolicy::Disabled => {}
            CleanupPolicy::Time { max_age_ms } => {
                let cutoff = now - max_age_ms;
                let mut removed = 0u64;
                for (key, slot) in self.all_slots() {
                    let mut guard = slot.lock().await;
                    if !guard.retired
                        && guard.state.holder.is_none()
                        && guard.queue.is_empty()
                        && guard.state.last_lock_date.is_none_or(|d| d < cutoff)
                    {
                        guard.retired = true;
                        drop(guard);
                        self.slots.remove(&key);
                        removed += 1;
                    }
                }
                if removed > 0 {
                    debug!(removed, "cleanup removed inactive lock records");
                }
            }
            CleanupPolicy::Count { max_records } => {
                let total = self.slots.len() as u64;
                if total <= max_records {
                    return;
                }
                let mut candidates = Vec::new();
                for (key, slot) in self.all_slots() {
                    let guard = slot.lock().await;
                    if !guard.retired && guard.state.holder.is_none() && guard.queue.is_empty() {
                        candidates.push((guard.state.last_lock_date, key, slot.clone()));
                    }
                }
                // Oldest activity first; never-locked records go first.
                candidates.sort_by_key(|(last, _, _)| last.unwrap_or(i64::MIN));
                let mut excess = total.saturating_sub(max_records);
                for (_, key, slot) in candidates {
                    if excess == 0 {
                        break;
                    }
                    let mut guard = slot.lock().await;
                    if !guard.retired && guard.state.holder.is_none() && guard.queue.is_empty() {
                        guard.retired = true;
                        drop(guard);
                        self.slots.remove(&key);
                        excess -= 1;
                    }
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), LockError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down in-process lock provider");
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
        for (_, slot) in self.all_slots() {
            let mut guard = slot.lock().await;
            for waiter in guard.queue.drain(..) {
                let _ = waiter.tx.send(Err(LockError::Disposed));
            }
        }
        LockError::aggregate(errors)
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
            // A dropped sender ends the wait as well; callers treat both as
            // a cancellation.
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
        None => std::future::pending().await,
    }
}

struct LocalDriver {
    inner: Weak<LocalInner>,
}

impl LocalDriver {
    fn upgrade(&self) -> Result<Arc<LocalInner>, LockError> {
        self.inner.upgrade().ok_or(LockError::Disposed)
    }
}

#[async_trait]
impl HandleDriver for LocalDriver {
    async fn extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> Result<ExtendOutcome, LockError> {
        let inner = self.upgrade()?;
        inner.ensure_open()?;
        let mut slot = inner.slot_guard(resource).await;
        if slot.state.is_held_by(holder) {
            let new_expiry = current_timestamp() + extend_ms;
            slot.state.expiry_date = Some(new_expiry);
            Ok(ExtendOutcome::Extended(new_expiry))
        } else {
            Ok(ExtendOutcome::Stale(stale_slot_kind(&slot.state)))
        }
    }

    async fn unlock(&self, resource: &str, holder: &str) -> Result<ReleaseOutcome, LockError> {
        let inner = self.upgrade()?;
        let Some(mut slot) = inner.existing_slot_guard(resource).await else {
            return Ok(ReleaseOutcome::Stale(StaleLockKind::NotHeld));
        };
        if !slot.state.is_held_by(holder) {
            return Ok(ReleaseOutcome::Stale(stale_slot_kind(&slot.state)));
        }
        debug!(resource, holder, "lock released");
        slot.state.holder = None;
        slot.state.locked_at = None;
        slot.state.expiry_date = None;
        inner.resolve_queue_locked(&mut slot, current_timestamp());
        Ok(ReleaseOutcome::Released)
    }

    async fn resource_expired(&self, resource: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(mut slot) = inner.existing_slot_guard(resource).await {
            inner.resolve_queue_locked(&mut slot, current_timestamp());
        }
    }

    async fn is_held_by(&self, resource: &str, holder: &str) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        match inner.existing_slot_guard(resource).await {
            Some(slot) => slot.state.is_held_by(holder),
            None => false,
        }
    }
}

fn stale_slot_kind(state: &ResourceLockState) -> StaleLockKind {
    if state.is_expired() {
        StaleLockKind::NotHeld
    } else {
        stale_kind(state.holder.as_deref())
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
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
        Ok(self.inner.peek_state(&normalize_resource(resource)).await)
    }

    async fn get_pending_requests(
        &self,
        resource: &str,
    ) -> Result<Vec<PendingRequestInfo>, LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        let key = normalize_resource(resource);
        match self.inner.existing_slot_guard(&key).await {
            Some(slot) => Ok(slot.queue.iter().map(|w| w.info.clone()).collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn query(&self, criteria: QueryCriteria) -> Result<Page<ResourceLockState>, LockError> {
        self.inner.ensure_open()?;
        Ok(self.inner.query(criteria).await)
    }

    async fn force_release(
        &self,
        resource: &str,
        remove_pending_requests: bool,
    ) -> Result<(), LockError> {
        self.inner.ensure_open()?;
        validate_identifier("resource", resource)?;
        self.inner
            .force_release(resource, remove_pending_requests)
            .await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), LockError> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> LocalLockProvider {
        LocalLockProvider::new(LockManagerConfig {
            cleanup_policy: CleanupPolicy::Disabled,
            ..LockManagerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let provider = provider();
        let handle = provider
            .acquire("Jobs.Nightly", "worker-a", AcquireOptions::new())
            .await
            .unwrap();
        assert_eq!(handle.resource(), "jobs.nightly");
        assert!(handle.has_lock().await);

        let second = provider
            .try_acquire("jobs.nightly", "worker-b", AcquireOptions::new())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_hands_over_in_fifo_order() {
        let provider = Arc::new(provider());
        let mut first = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();

        let p1 = provider.clone();
        let waiter_b = tokio::spawn(async move {
            p1.acquire("r", "b", AcquireOptions::new()).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let p2 = provider.clone();
        let waiter_c = tokio::spawn(async move {
            p2.acquire("r", "c", AcquireOptions::new()).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(provider.get("r").await.unwrap().pending_request_count, 2);

        first.release().await.unwrap();
        let mut second = waiter_b.await.unwrap();
        assert_eq!(second.holder(), "b");
        assert!(!waiter_c.is_finished());

        second.release().await.unwrap();
        let third = waiter_c.await.unwrap();
        assert_eq!(third.holder(), "c");
    }

    #[tokio::test]
    async fn test_same_holder_renewal_bypasses_queue() {
        let provider = Arc::new(provider());
        let _handle = provider
            .acquire("r", "a", AcquireOptions::new().expiry(Duration::from_secs(60)))
            .await
            .unwrap();

        let p = provider.clone();
        let _waiter = tokio::spawn(async move {
            let _ = p.acquire("r", "b", AcquireOptions::new()).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(provider.get("r").await.unwrap().pending_request_count, 1);

        let renewed = provider
            .try_acquire("r", "A", AcquireOptions::new().expiry(Duration::from_secs(120)))
            .await
            .unwrap();
        let renewed = renewed.expect("same-holder renewal should succeed");
        assert_eq!(renewed.resource(), "r");
        assert!(renewed.expiry_date().is_some());

        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_timeout_carries_snapshot() {
        let provider = provider();
        let _holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();

        let err = provider
            .acquire(
                "r",
                "b",
                AcquireOptions::new().timeout(Duration::from_millis(60)),
            )
            .await
            .unwrap_err();
        match err {
            LockError::Timeout {
                state,
                requester,
                timeout,
            } => {
                assert_eq!(state.resource, "r");
                assert_eq!(state.holder.as_deref(), Some("a"));
                assert_eq!(requester, "b");
                assert_eq!(timeout, Duration::from_millis(60));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // The timed-out request must no longer be queued.
        assert_eq!(provider.get("r").await.unwrap().pending_request_count, 0);
    }

    #[tokio::test]
    async fn test_cancellation_only_affects_the_cancelled_request() {
        let provider = Arc::new(provider());
        let mut holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let p1 = provider.clone();
        let cancelled = tokio::spawn(async move {
            p1.acquire("r", "b", AcquireOptions::new().cancel(cancel_rx))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let p2 = provider.clone();
        let survivor = tokio::spawn(async move {
            p2.acquire("r", "c", AcquireOptions::new()).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        cancel_tx.send(true).unwrap();
        let err = cancelled.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled));

        holder.release().await.unwrap();
        let next = survivor.await.unwrap();
        assert_eq!(next.holder(), "c");
    }

    #[tokio::test]
    async fn test_expired_hold_passes_to_waiter() {
        let provider = Arc::new(provider());
        let _holder = provider
            .acquire(
                "r",
                "a",
                AcquireOptions::new().expiry(Duration::from_millis(80)),
            )
            .await
            .unwrap();

        let p = provider.clone();
        let waiter = tokio::spawn(async move {
            p.acquire("r", "b", AcquireOptions::new()).await.unwrap()
        });

        let next = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should be granted after the hold expires")
            .unwrap();
        assert_eq!(next.holder(), "b");
        assert!(provider.get("r").await.unwrap().is_held_by("b"));
    }

    #[tokio::test]
    async fn test_expired_hold_with_empty_queue_frees_the_resource() {
        let provider = provider();
        let _holder = provider
            .acquire(
                "r",
                "a",
                AcquireOptions::new().expiry(Duration::from_millis(40)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let state = provider.get("r").await.unwrap();
        assert!(state.holder.is_none());
        assert!(state.expiry_date.is_none());
    }

    #[tokio::test]
    async fn test_keep_alive_extends_expiry() {
        let provider = LocalLockProvider::new(LockManagerConfig {
            cleanup_policy: CleanupPolicy::Disabled,
            renewal_offset_ms: 40,
            keep_alive_extension_ms: 60_000,
            ..LockManagerConfig::default()
        });
        let handle = provider
            .acquire(
                "r",
                "a",
                AcquireOptions::new()
                    .expiry(Duration::from_millis(120))
                    .keep_alive(true),
            )
            .await
            .unwrap();
        let initial_expiry = handle.expiry_date().unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.has_lock().await);
        assert!(handle.expiry_date().unwrap() > initial_expiry);
    }

    #[tokio::test]
    async fn test_extend_initializes_expiry_and_rejects_stale() {
        let provider = provider();
        let mut handle = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        assert!(handle.expiry_date().is_none());
        assert!(handle.extend(Duration::from_secs(60)).await.unwrap());
        assert!(handle.expiry_date().is_some());

        provider.force_release("r", false).await.unwrap();
        assert!(!handle.extend(Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_release_raises_when_configured() {
        let provider = LocalLockProvider::new(LockManagerConfig {
            cleanup_policy: CleanupPolicy::Disabled,
            throw_on_stale_lock: true,
            ..LockManagerConfig::default()
        });
        let mut first = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        provider.force_release("r", false).await.unwrap();
        let second = provider
            .try_acquire("r", "b", AcquireOptions::new())
            .await
            .unwrap()
            .unwrap();

        let err = first.release().await.unwrap_err();
        match err {
            LockError::Stale(StaleLockKind::HeldByOther(other)) => assert_eq!(other, "b"),
            other => panic!("expected stale error, got {other:?}"),
        }
        assert!(second.has_lock().await);
    }

    #[tokio::test]
    async fn test_force_release_can_drop_pending_requests() {
        let provider = Arc::new(provider());
        let _holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        let p = provider.clone();
        let waiter = tokio::spawn(async move { p.acquire("r", "b", AcquireOptions::new()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        provider.force_release("r", true).await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Cancelled));

        let state = provider.get("r").await.unwrap();
        assert!(state.holder.is_none());
        assert_eq!(state.pending_request_count, 0);
    }

    #[tokio::test]
    async fn test_later_caller_services_the_waiting_head_first() {
        let provider = Arc::new(provider());
        let _holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        let p1 = provider.clone();
        let waiter_b = tokio::spawn(async move {
            p1.acquire("r", "b", AcquireOptions::new()).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Free the resource but keep the queue; the next acquire call must
        // grant the waiting head and line up behind it.
        provider.force_release("r", false).await.unwrap();
        let p2 = provider.clone();
        let waiter_c = tokio::spawn(async move {
            p2.acquire("r", "c", AcquireOptions::new()).await.unwrap()
        });
        let mut second = tokio::time::timeout(Duration::from_millis(500), waiter_b)
            .await
            .expect("head waiter should be granted by the later call")
            .unwrap();
        assert_eq!(second.holder(), "b");
        assert!(!waiter_c.is_finished());

        second.release().await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(500), waiter_c)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.holder(), "c");
    }

    #[tokio::test]
    async fn test_unknown_resource_reports_free_state() {
        let provider = provider();
        let state = provider.get("Never.Seen").await.unwrap();
        assert_eq!(state.resource, "never.seen");
        assert!(state.holder.is_none());
        assert_eq!(state.pending_request_count, 0);
    }

    #[tokio::test]
    async fn test_pending_requests_are_reported_oldest_first() {
        let provider = Arc::new(provider());
        let _holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        for requester in ["b", "c"] {
            let p = provider.clone();
            let requester = requester.to_string();
            tokio::spawn(async move {
                let _ = p.acquire("r", &requester, AcquireOptions::new()).await;
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let pending = provider.get_pending_requests("r").await.unwrap();
        let requesters: Vec<&str> = pending.iter().map(|p| p.requester.as_str()).collect();
        assert_eq!(requesters, vec!["b", "c"]);
        assert!(pending[0].created_time <= pending[1].created_time);
        assert!(pending[0].id < pending[1].id);

        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_filters_held_locks() {
        let provider = provider();
        let _a = provider
            .acquire("res.one", "alpha", AcquireOptions::new())
            .await
            .unwrap();
        let _b = provider
            .acquire("res.two", "beta", AcquireOptions::new())
            .await
            .unwrap();

        let page = provider
            .query(QueryCriteria::new().holder_contains("alph"))
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.page_items[0].resource, "res.one");
    }

    #[tokio::test]
    async fn test_validation_rejects_blank_identifiers() {
        let provider = provider();
        let err = provider
            .acquire("  ", "a", AcquireOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Validation(_)));
        let err = provider.get_pending_requests("").await.unwrap_err();
        assert!(matches!(err, LockError::Validation(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters_and_later_calls() {
        let provider = Arc::new(provider());
        let _holder = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        let p = provider.clone();
        let waiter = tokio::spawn(async move { p.acquire("r", "b", AcquireOptions::new()).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        provider.shutdown().await.unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Disposed));

        let err = provider.get("r").await.unwrap_err();
        assert!(matches!(err, LockError::Disposed));
        // Idempotent.
        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_time_cleanup_removes_inactive_records() {
        let provider = LocalLockProvider::new(LockManagerConfig {
            cleanup_policy: CleanupPolicy::Time { max_age_ms: 30 },
            cleanup_interval_ms: 3_600_000,
            ..LockManagerConfig::default()
        });
        let mut handle = provider
            .acquire("r", "a", AcquireOptions::new())
            .await
            .unwrap();
        handle.release().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        provider.inner.run_cleanup_cycle().await;
        assert!(provider.inner.slots.is_empty());
    }

    #[tokio::test]
    async fn test_count_cleanup_keeps_held_records() {
        let provider = LocalLockProvider::new(LockManagerConfig {
            cleanup_policy: CleanupPolicy::Count { max_records: 1 },
            cleanup_interval_ms: 3_600_000,
            ..LockManagerConfig::default()
        });
        let _held = provider
            .acquire("busy", "a", AcquireOptions::new())
            .await
            .unwrap();
        let mut idle = provider
            .acquire("idle", "a", AcquireOptions::new())
            .await
            .unwrap();
        idle.release().await.unwrap();

        provider.inner.run_cleanup_cycle().await;
        assert!(provider.inner.slots.contains_key("busy"));
        assert!(!provider.inner.slots.contains_key("idle"));
    }
}
