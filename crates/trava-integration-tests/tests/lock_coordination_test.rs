//! End-to-end lock coordination scenarios, run against both strategies.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use trava_common::error::LockError;
use trava_common::model::{LockSortField, QueryCriteria};
use trava_core::{AcquireOptions, LockProvider};
use trava_integration_tests::{database_provider, local_provider};

async fn exercise_contention_and_handover(provider: Arc<dyn LockProvider>) {
    let mut first = provider
        .acquire("Jobs.Nightly", "worker-a", AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(first.resource(), "jobs.nightly");
    assert!(first.has_lock().await);

    // A second requester cannot take the resource while it is held.
    assert!(provider
        .try_acquire("JOBS.NIGHTLY", "worker-b", AcquireOptions::new())
        .await
        .unwrap()
        .is_none());

    let p = provider.clone();
    let waiter = tokio::spawn(async move {
        p.acquire("jobs.nightly", "worker-b", AcquireOptions::new())
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = provider.get("jobs.nightly").await.unwrap();
    assert!(state.is_held_by("worker-a"));
    assert_eq!(state.pending_request_count, 1);

    first.release().await.unwrap();
    let mut second = tokio::time::timeout(Duration::from_millis(500), waiter)
        .await
        .expect("waiter should be granted after release")
        .unwrap();
    assert_eq!(second.holder(), "worker-b");
    assert!(second.has_lock().await);
    second.release().await.unwrap();

    let state = provider.get("jobs.nightly").await.unwrap();
    assert!(state.holder.is_none());
    provider.shutdown().await.unwrap();
}

async fn exercise_timeout_and_cancellation(provider: Arc<dyn LockProvider>) {
    let _holder = provider
        .acquire("r", "a", AcquireOptions::new())
        .await
        .unwrap();

    let err = provider
        .acquire(
            "r",
            "b",
            AcquireOptions::new().timeout(Duration::from_millis(80)),
        )
        .await
        .unwrap_err();
    match err {
        LockError::Timeout { state, requester, .. } => {
            assert_eq!(state.holder.as_deref(), Some("a"));
            assert_eq!(requester, "b");
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let p = provider.clone();
    let cancelled = tokio::spawn(async move {
        p.acquire("r", "c", AcquireOptions::new().cancel(cancel_rx))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();
    let err = cancelled.await.unwrap().unwrap_err();
    assert!(matches!(err, LockError::Cancelled));

    // Neither outcome disturbed the hold or left requests behind.
    let state = provider.get("r").await.unwrap();
    assert!(state.is_held_by("a"));
    assert_eq!(state.pending_request_count, 0);
    assert!(provider.get_pending_requests("r").await.unwrap().is_empty());
    provider.shutdown().await.unwrap();
}

async fn exercise_expiry_and_extension(provider: Arc<dyn LockProvider>) {
    let mut handle = provider
        .acquire(
            "short",
            "a",
            AcquireOptions::new().expiry(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    let initial = handle.expiry_date().unwrap();
    assert!(handle.extend(Duration::from_secs(300)).await.unwrap());
    assert!(handle.expiry_date().unwrap() > initial);
    handle.release().await.unwrap();

    // An expired hold passes to the queued waiter without a release call.
    let _expiring = provider
        .acquire(
            "short",
            "a",
            AcquireOptions::new().expiry(Duration::from_millis(80)),
        )
        .await
        .unwrap();
    let p = provider.clone();
    let waiter = tokio::spawn(async move {
        p.acquire("short", "b", AcquireOptions::new()).await.unwrap()
    });
    let granted = tokio::time::timeout(Duration::from_millis(600), waiter)
        .await
        .expect("waiter should inherit the expired hold")
        .unwrap();
    assert_eq!(granted.holder(), "b");
    provider.shutdown().await.unwrap();
}

async fn exercise_keep_alive(provider: Arc<dyn LockProvider>) {
    let handle = provider
        .acquire(
            "renewing",
            "a",
            AcquireOptions::new()
                .expiry(Duration::from_millis(120))
                .keep_alive(true),
        )
        .await
        .unwrap();
    let initial = handle.expiry_date().unwrap();

    // Well past the original expiry the hold is still alive and pushed out.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.has_lock().await);
    assert!(handle.expiry_date().unwrap() > initial);
    provider.shutdown().await.unwrap();
}

async fn exercise_query(provider: Arc<dyn LockProvider>) {
    // Handles stay alive for the duration of the scenario.
    let mut handles = Vec::new();
    for (resource, holder) in [
        ("inventory.eu", "picker-1"),
        ("inventory.us", "picker-2"),
        ("billing.eu", "biller-1"),
    ] {
        handles.push(
            provider
                .acquire(resource, holder, AcquireOptions::new())
                .await
                .unwrap(),
        );
    }

    let page = provider
        .query(
            QueryCriteria::new()
                .resource_contains("inventory")
                .order_by(LockSortField::Resource, true),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 2);
    let resources: Vec<&str> = page
        .page_items
        .iter()
        .map(|s| s.resource.as_str())
        .collect();
    assert_eq!(resources, vec!["inventory.us", "inventory.eu"]);

    let page = provider
        .query(QueryCriteria::new().holder_contains("biller").paged(1, 1))
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.pages_available, 1);
    assert_eq!(page.page_items[0].resource, "billing.eu");
    provider.shutdown().await.unwrap();
}

async fn exercise_force_release(provider: Arc<dyn LockProvider>) {
    let _holder = provider
        .acquire("r", "a", AcquireOptions::new())
        .await
        .unwrap();
    let p = provider.clone();
    let waiter = tokio::spawn(async move { p.acquire("r", "b", AcquireOptions::new()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    provider.force_release("r", true).await.unwrap();
    let err = tokio::time::timeout(Duration::from_millis(600), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, LockError::Cancelled));
    let state = provider.get("r").await.unwrap();
    assert!(state.holder.is_none());
    assert_eq!(state.pending_request_count, 0);
    provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_contention_and_handover() {
    exercise_contention_and_handover(local_provider()).await;
}

#[tokio::test]
async fn test_database_contention_and_handover() {
    exercise_contention_and_handover(database_provider()).await;
}

#[tokio::test]
async fn test_local_timeout_and_cancellation() {
    exercise_timeout_and_cancellation(local_provider()).await;
}

#[tokio::test]
async fn test_database_timeout_and_cancellation() {
    exercise_timeout_and_cancellation(database_provider()).await;
}

#[tokio::test]
async fn test_local_expiry_and_extension() {
    exercise_expiry_and_extension(local_provider()).await;
}

#[tokio::test]
async fn test_database_expiry_and_extension() {
    exercise_expiry_and_extension(database_provider()).await;
}

#[tokio::test]
async fn test_local_keep_alive() {
    exercise_keep_alive(local_provider()).await;
}

#[tokio::test]
async fn test_database_keep_alive() {
    exercise_keep_alive(database_provider()).await;
}

#[tokio::test]
async fn test_local_query() {
    exercise_query(local_provider()).await;
}

#[tokio::test]
async fn test_database_query() {
    exercise_query(database_provider()).await;
}

#[tokio::test]
async fn test_local_force_release() {
    exercise_force_release(local_provider()).await;
}

#[tokio::test]
async fn test_database_force_release() {
    exercise_force_release(database_provider()).await;
}
