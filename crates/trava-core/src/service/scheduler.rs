//! Repeating background task scheduler
//!
//! The scheduler collaborator used for expiry sweeps and the cross-process
//! reconciliation workers: repeating named units of work with a configurable
//! initial delay and interval, cancelled as a group during shutdown with a
//! bounded deadline. Cycle failures are logged and retried on the next tick,
//! never fatal to the owning provider.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use trava_common::error::LockError;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Wait until the stop channel reads true. The watch read guard is dropped
/// in here instead of inside a caller's select arm, which keeps the select
/// futures Send.
pub(crate) async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// One schedulable unit of work, re-invoked every interval.
pub type RepeatingJob = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Scheduler collaborator contract.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Schedule `job` to run every `interval` after `initial_delay`.
    fn schedule_repeating(
        &self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        job: RepeatingJob,
    );

    /// Cancel all scheduled work owned by this instance and await graceful
    /// completion, bounded by `deadline`.
    async fn cancel_all(&self, deadline: Duration) -> Result<(), LockError>;
}

/// Tokio-backed scheduler: one spawned interval loop per job, stopped
/// through a shared watch channel.
pub struct TokioScheduler {
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskScheduler for TokioScheduler {
    fn schedule_repeating(
        &self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        job: RepeatingJob,
    ) {
        let task_name = name.to_string();
        let mut stop_rx = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = wait_for_stop(&mut stop_rx) => return,
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job().await {
                            warn!(task = %task_name, error = %e, "scheduled task cycle failed");
                        }
                    }
                    _ = wait_for_stop(&mut stop_rx) => {
                        debug!(task = %task_name, "scheduled task stopped");
                        return;
                    }
                }
            }
        });
        self.tasks.lock().push((name.to_string(), handle));
    }

    async fn cancel_all(&self, deadline: Duration) -> Result<(), LockError> {
        let _ = self.stop.send(true);
        let tasks: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        let cutoff = tokio::time::Instant::now() + deadline;

        let mut errors = Vec::new();
        for (name, handle) in tasks {
            let remaining = cutoff.saturating_duration_since(tokio::time::Instant::now());
            let abort = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    errors.push(LockError::Store(anyhow::anyhow!(
                        "scheduled task '{name}' failed to join: {join_err}"
                    )));
                }
                Err(_) => {
                    abort.abort();
                    errors.push(LockError::Store(anyhow::anyhow!(
                        "scheduled task '{name}' did not stop within the shutdown deadline"
                    )));
                }
            }
        }
        LockError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_job(counter: Arc<AtomicU32>) -> RepeatingJob {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_repeating_job_runs_until_cancelled() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.schedule_repeating(
            "counter",
            Duration::from_millis(0),
            Duration::from_millis(10),
            counting_job(counter.clone()),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.cancel_all(Duration::from_secs(1)).await.unwrap();
        let after_cancel = counter.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "expected at least two cycles, got {after_cancel}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_initial_delay_defers_first_cycle() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler.schedule_repeating(
            "delayed",
            Duration::from_millis(80),
            Duration::from_millis(10),
            counting_job(counter.clone()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.cancel_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_job_is_retried_next_cycle() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let attempts = counter.clone();
        scheduler.schedule_repeating(
            "flaky",
            Duration::from_millis(0),
            Duration::from_millis(10),
            Arc::new(move || {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("cycle failure")
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.cancel_all(Duration::from_secs(1)).await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_all_is_reusable_when_empty() {
        let scheduler = TokioScheduler::new();
        scheduler.cancel_all(Duration::from_millis(10)).await.unwrap();
    }
}
