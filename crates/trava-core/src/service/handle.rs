//! Acquired lock handle and its expiry/keep-alive controller
//!
//! A handle is the capability object returned to a successful caller. Each
//! handle with an expiry owns exactly one background loop: in notify mode it
//! signals the coordinator at the expiry instant so the assignment algorithm
//! runs; in keep-alive mode it renews the expiry shortly before it arrives.
//! Releasing a handle stops the loop and waits for it to finish before the
//! final unlock is considered complete.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use trava_common::error::{LockError, StaleLockKind};
use trava_common::model::{LockManagerConfig, ResourceLockState};
use trava_common::utils::current_timestamp;

use super::scheduler::wait_for_stop;

/// Outcome of an ownership-checked extension.
pub(crate) enum ExtendOutcome {
    Extended(i64),
    Stale(StaleLockKind),
}

/// Outcome of an ownership-checked release.
pub(crate) enum ReleaseOutcome {
    Released,
    Stale(StaleLockKind),
}

/// Strategy-side operations a handle needs for its lifetime: extension,
/// final unlock, expiry notification and ownership re-checks.
#[async_trait]
pub(crate) trait HandleDriver: Send + Sync + 'static {
    async fn extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> Result<ExtendOutcome, LockError>;

    async fn unlock(&self, resource: &str, holder: &str) -> Result<ReleaseOutcome, LockError>;

    /// Run the assignment algorithm after an observed expiry: grant the
    /// queue head, or clear the holder when nothing is queued.
    async fn resource_expired(&self, resource: &str);

    async fn is_held_by(&self, resource: &str, holder: &str) -> bool;
}

pub(crate) fn stale_kind(holder: Option<&str>) -> StaleLockKind {
    match holder {
        Some(other) => StaleLockKind::HeldByOther(other.to_string()),
        None => StaleLockKind::NotHeld,
    }
}

struct HandleCore {
    resource: String,
    holder: String,
    locked_at: Option<i64>,
    last_lock_date: Option<i64>,
    /// Mutated in place as the expiry is extended.
    expiry: Mutex<Option<i64>>,
    released: AtomicBool,
}

/// Capability object representing current ownership of a resource.
///
/// Released exactly once: explicitly through [`release`](Self::release), or
/// best-effort on drop.
pub struct AcquiredLockHandle {
    core: Arc<HandleCore>,
    driver: Arc<dyn HandleDriver>,
    config: Arc<LockManagerConfig>,
    keep_alive: bool,
    stop_tx: Option<mpsc::Sender<()>>,
    loop_task: Option<JoinHandle<()>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AcquiredLockHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        resource: String,
        holder: String,
        locked_at: Option<i64>,
        last_lock_date: Option<i64>,
        expiry: Option<i64>,
        keep_alive: bool,
        driver: Arc<dyn HandleDriver>,
        config: Arc<LockManagerConfig>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let has_expiry = expiry.is_some();
        let mut handle = Self {
            core: Arc::new(HandleCore {
                resource,
                holder,
                locked_at,
                last_lock_date,
                expiry: Mutex::new(expiry),
                released: AtomicBool::new(false),
            }),
            driver,
            config,
            keep_alive,
            stop_tx: None,
            loop_task: None,
            shutdown_rx,
        };
        if has_expiry {
            handle.spawn_loop();
        }
        handle
    }

    fn spawn_loop(&mut self) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_expiry_loop(
            self.core.clone(),
            self.driver.clone(),
            self.config.clone(),
            self.keep_alive,
            stop_rx,
            self.shutdown_rx.clone(),
        ));
        self.stop_tx = Some(stop_tx);
        self.loop_task = Some(task);
    }

    pub fn resource(&self) -> &str {
        &self.core.resource
    }

    pub fn holder(&self) -> &str {
        &self.core.holder
    }

    pub fn locked_at(&self) -> Option<i64> {
        self.core.locked_at
    }

    pub fn last_lock_date(&self) -> Option<i64> {
        self.core.last_lock_date
    }

    /// Current expiry instant (Unix millis); moves forward on extension.
    pub fn expiry_date(&self) -> Option<i64> {
        *self.core.expiry.lock()
    }

    pub fn is_released(&self) -> bool {
        self.core.released.load(Ordering::SeqCst)
    }

    /// Snapshot of the ownership this handle was granted.
    pub fn state(&self) -> ResourceLockState {
        ResourceLockState {
            resource: self.core.resource.clone(),
            holder: Some(self.core.holder.clone()),
            locked_at: self.core.locked_at,
            last_lock_date: self.core.last_lock_date,
            expiry_date: self.expiry_date(),
            pending_request_count: 0,
        }
    }

    /// Re-check current ownership against the coordinator.
    pub async fn has_lock(&self) -> bool {
        if self.is_released() {
            return false;
        }
        self.driver
            .is_held_by(&self.core.resource, &self.core.holder)
            .await
    }

    /// Extend the hold by `extend` from now. Returns `false` (or raises
    /// `LockError::Stale`, per configuration) when the handle is stale.
    ///
    /// A hold acquired without an expiry gets one initialized here, and the
    /// expiry loop starts at that point.
    pub async fn extend(&mut self, extend: Duration) -> Result<bool, LockError> {
        if self.is_released() {
            return self.stale_result(StaleLockKind::NotHeld);
        }
        let outcome = self
            .driver
            .extend(
                &self.core.resource,
                &self.core.holder,
                extend.as_millis() as i64,
            )
            .await?;
        match outcome {
            ExtendOutcome::Extended(new_expiry) => {
                *self.core.expiry.lock() = Some(new_expiry);
                if self.loop_task.is_none() {
                    self.spawn_loop();
                }
                Ok(true)
            }
            ExtendOutcome::Stale(kind) => self.stale_result(kind),
        }
    }

    fn stale_result(&self, kind: StaleLockKind) -> Result<bool, LockError> {
        if self.config.throw_on_stale_lock {
            Err(LockError::Stale(kind))
        } else {
            Ok(false)
        }
    }

    /// Release the hold. Idempotent: the first call stops and joins the
    /// background loop, then issues the final unlock; later calls no-op.
    pub async fn release(&mut self) -> Result<(), LockError> {
        if self.core.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.try_send(());
        }
        if let Some(task) = self.loop_task.take() {
            let _ = task.await;
        }
        let outcome = self
            .driver
            .unlock(&self.core.resource, &self.core.holder)
            .await?;
        match outcome {
            ReleaseOutcome::Released => Ok(()),
            ReleaseOutcome::Stale(kind) => {
                if self.config.throw_on_stale_lock {
                    Err(LockError::Stale(kind))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Discard a handle whose grant could not be delivered: the caller rolls
    /// the state back itself, so no unlock must be issued here.
    pub(crate) fn abandon(mut self) {
        self.core.released.store(true, Ordering::SeqCst);
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.try_send(());
        }
        // The detached loop task exits on the stop signal.
        self.loop_task = None;
    }
}

impl Drop for AcquiredLockHandle {
    fn drop(&mut self) {
        if self.core.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.try_send(());
        }
        // Scope exit without an explicit release: best-effort final unlock.
        let driver = self.driver.clone();
        let core = self.core.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = driver.unlock(&core.resource, &core.holder).await;
            });
        }
    }
}

impl std::fmt::Debug for AcquiredLockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredLockHandle")
            .field("resource", &self.core.resource)
            .field("holder", &self.core.holder)
            .field("expiry_date", &self.expiry_date())
            .field("released", &self.is_released())
            .finish()
    }
}

async fn run_expiry_loop(
    core: Arc<HandleCore>,
    driver: Arc<dyn HandleDriver>,
    config: Arc<LockManagerConfig>,
    keep_alive: bool,
    mut stop_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut keep_alive = keep_alive;
    loop {
        let Some(expiry) = *core.expiry.lock() else {
            return;
        };
        let offset = if keep_alive {
            config.renewal_offset_ms as i64
        } else {
            0
        };
        let wait_ms = (expiry - offset - current_timestamp()).max(0) as u64;
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = wait_for_stop(&mut shutdown_rx) => return,
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
        }
        if core.released.load(Ordering::SeqCst) {
            return;
        }
        // Re-read: a foreground extension may have moved the target while
        // this loop slept.
        let Some(current) = *core.expiry.lock() else {
            return;
        };
        let now = current_timestamp();
        if keep_alive {
            if now < current - offset {
                continue;
            }
            let outcome = driver
                .extend(
                    &core.resource,
                    &core.holder,
                    config.keep_alive_extension_ms as i64,
                )
                .await;
            match outcome {
                Ok(ExtendOutcome::Extended(new_expiry)) => {
                    *core.expiry.lock() = Some(new_expiry);
                    debug!(resource = %core.resource, holder = %core.holder, "keep-alive renewed");
                }
                Ok(ExtendOutcome::Stale(kind)) => {
                    debug!(resource = %core.resource, %kind, "keep-alive stopped: handle is stale");
                    return;
                }
                Err(e) => {
                    warn!(
                        resource = %core.resource,
                        error = %e,
                        "keep-alive renewal failed; degrading to expiry notification"
                    );
                    keep_alive = false;
                }
            }
        } else {
            if now < current {
                continue;
            }
            driver.resource_expired(&core.resource).await;
            return;
        }
    }
}
