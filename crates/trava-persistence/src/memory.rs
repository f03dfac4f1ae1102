//! In-memory lock store
//!
//! A `LockPersistence` implementation holding everything in process memory,
//! with the same grant and reconciliation semantics as the SQL backend. Used
//! by the test suites and suitable for single-process deployments that want
//! the cross-process code path without a database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use trava_common::model::{
    NewLockRequest, Page, PendingRequestInfo, QueryCriteria, ResourceLockState,
};
use trava_common::query;
use trava_common::utils::{current_timestamp, identifier_eq};

use crate::traits::LockPersistence;

/// Lock ordering: whenever both tables are held at once, `locks` is taken
/// before `requests`.
#[derive(Default)]
pub struct MemoryLockPersistService {
    locks: Mutex<HashMap<String, ResourceLockState>>,
    requests: Mutex<Vec<PendingRequestInfo>>,
    next_id: AtomicI64,
}

impl MemoryLockPersistService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResourceLockState>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request_table(&self) -> std::sync::MutexGuard<'_, Vec<PendingRequestInfo>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_request_from_other(&self, resource: &str, requester: &str, now: i64) -> bool {
        self.request_table().iter().any(|r| {
            r.resource == resource
                && !identifier_eq(&r.requester, requester)
                && !r.is_timed_out_at(now)
        })
    }

    /// Oldest pending request for the resource, if any.
    fn head_request(&self, resource: &str) -> Option<PendingRequestInfo> {
        let requests = self.request_table();
        let mut matching: Vec<PendingRequestInfo> = requests
            .iter()
            .filter(|r| r.resource == resource)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.created_time, r.id));
        matching.into_iter().next()
    }

    fn grant(state: &mut ResourceLockState, requester: &str, expiry_ms: Option<i64>, now: i64) {
        state.holder = Some(requester.to_string());
        state.locked_at = Some(now);
        state.last_lock_date = Some(now);
        state.expiry_date = expiry_ms.map(|ms| now + ms);
    }

    fn clear_hold(state: &mut ResourceLockState) {
        state.holder = None;
        state.locked_at = None;
        state.expiry_date = None;
    }

    /// Drop every pending request the given requester has for the resource;
    /// a grant supersedes them all.
    fn remove_requester_rows(&self, resource: &str, requester: &str) {
        self.request_table()
            .retain(|r| !(r.resource == resource && identifier_eq(&r.requester, requester)));
    }
}

#[async_trait]
impl LockPersistence for MemoryLockPersistService {
    async fn get_state(
        &self,
        resource: &str,
        include_pending: bool,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let state = self.lock_table().get(resource).cloned();
        Ok(state.map(|mut s| {
            s.pending_request_count = if include_pending {
                self.request_table()
                    .iter()
                    .filter(|r| r.resource == resource)
                    .count() as u64
            } else {
                0
            };
            s
        }))
    }

    async fn try_assign(
        &self,
        resource: &str,
        requester: &str,
        expiry_ms: Option<i64>,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let now = current_timestamp();
        let mut locks = self.lock_table();
        let state = locks
            .entry(resource.to_string())
            .or_insert_with(|| ResourceLockState::free(resource));
        if state.is_held_by(requester) {
            state.last_lock_date = Some(now);
            state.expiry_date = expiry_ms.map(|ms| now + ms);
            return Ok(Some(state.clone()));
        }
        if !state.is_grantable(now) || self.live_request_from_other(resource, requester, now) {
            return Ok(None);
        }
        Self::grant(state, requester, expiry_ms, now);
        let snapshot = state.clone();
        drop(locks);
        self.remove_requester_rows(resource, requester);
        Ok(Some(snapshot))
    }

    async fn unlock_if_held(&self, resource: &str, holder: &str) -> anyhow::Result<bool> {
        let mut locks = self.lock_table();
        match locks.get_mut(resource) {
            Some(state) if state.is_held_by(holder) => {
                Self::clear_hold(state);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> anyhow::Result<Option<i64>> {
        let mut locks = self.lock_table();
        match locks.get_mut(resource) {
            Some(state) if state.is_held_by(holder) => {
                let new_expiry = current_timestamp() + extend_ms;
                state.expiry_date = Some(new_expiry);
                Ok(Some(new_expiry))
            }
            _ => Ok(None),
        }
    }

    async fn insert_request(&self, request: NewLockRequest) -> anyhow::Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.request_table().push(PendingRequestInfo {
            id,
            resource: request.resource,
            requester: request.requester,
            requested_expiry_ms: request.requested_expiry_ms,
            keep_alive: request.keep_alive,
            timeout_time: request.timeout_time,
            created_time: request.created_time,
        });
        Ok(id)
    }

    async fn delete_requests(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut requests = self.request_table();
        let before = requests.len();
        requests.retain(|r| !ids.contains(&r.id));
        Ok((before - requests.len()) as u64)
    }

    async fn requests_for_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Vec<PendingRequestInfo>> {
        let mut matching: Vec<PendingRequestInfo> = self
            .request_table()
            .iter()
            .filter(|r| r.resource == resource)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.created_time, r.id));
        Ok(matching)
    }

    async fn requests_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<PendingRequestInfo>> {
        Ok(self
            .request_table()
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn deleted_request_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>> {
        let requests = self.request_table();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| !requests.iter().any(|r| r.id == *id))
            .collect())
    }

    async fn resources_with_pending_requests(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let mut resources: Vec<String> = self
            .request_table()
            .iter()
            .map(|r| r.resource.clone())
            .collect();
        resources.sort();
        resources.dedup();
        resources.truncate(limit);
        Ok(resources)
    }

    async fn reconcile_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let now = current_timestamp();
        self.request_table()
            .retain(|r| !(r.resource == resource && r.is_timed_out_at(now)));
        let head = self.head_request(resource);
        let mut locks = self.lock_table();
        let state = locks
            .entry(resource.to_string())
            .or_insert_with(|| ResourceLockState::free(resource));
        if !state.is_grantable(now) {
            return Ok(None);
        }
        match head {
            Some(head) => {
                Self::grant(state, &head.requester, head.requested_expiry_ms, now);
                let snapshot = state.clone();
                drop(locks);
                self.remove_requester_rows(resource, &head.requester);
                Ok(Some(snapshot))
            }
            None => {
                if state.is_expired_at(now) {
                    Self::clear_hold(state);
                    return Ok(Some(state.clone()));
                }
                Ok(None)
            }
        }
    }

    async fn force_release(&self, resource: &str, remove_requests: bool) -> anyhow::Result<()> {
        if let Some(state) = self.lock_table().get_mut(resource) {
            Self::clear_hold(state);
        }
        if remove_requests {
            self.request_table().retain(|r| r.resource != resource);
        }
        Ok(())
    }

    async fn search(&self, criteria: &QueryCriteria) -> anyhow::Result<Page<ResourceLockState>> {
        let items: Vec<ResourceLockState> = {
            let locks = self.lock_table();
            let requests = self.request_table();
            locks
                .values()
                .map(|s| ResourceLockState {
                    pending_request_count: requests
                        .iter()
                        .filter(|r| r.resource == s.resource)
                        .count() as u64,
                    ..s.clone()
                })
                .collect()
        };
        Ok(query::apply(criteria, items, current_timestamp()))
    }

    async fn delete_inactive(&self, older_than_ms: Option<i64>) -> anyhow::Result<u64> {
        let cutoff = older_than_ms.map(|age| current_timestamp() - age);
        let mut locks = self.lock_table();
        let requests = self.request_table();
        let before = locks.len();
        locks.retain(|resource, state| {
            state.holder.is_some()
                || requests.iter().any(|r| &r.resource == resource)
                || cutoff.is_some_and(|c| state.last_lock_date.is_some_and(|d| d >= c))
        });
        Ok((before - locks.len()) as u64)
    }

    async fn count_locks(&self) -> anyhow::Result<u64> {
        Ok(self.lock_table().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_assign_respects_queue_priority() {
        let store = MemoryLockPersistService::new();
        store.try_assign("r", "a", None).await.unwrap().unwrap();
        let id = store
            .insert_request(NewLockRequest {
                resource: "r".into(),
                requester: "b".into(),
                requested_expiry_ms: None,
                keep_alive: false,
                timeout_time: None,
                created_time: current_timestamp(),
            })
            .await
            .unwrap();
        store.unlock_if_held("r", "a").await.unwrap();

        // The queued request from b blocks a direct grant to c.
        assert!(store.try_assign("r", "c", None).await.unwrap().is_none());
        let state = store.reconcile_resource("r").await.unwrap().unwrap();
        assert!(state.is_held_by("b"));
        assert_eq!(store.deleted_request_ids(&[id]).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_renewal_supersedes_own_request_rows() {
        let store = MemoryLockPersistService::new();
        store
            .insert_request(NewLockRequest {
                resource: "r".into(),
                requester: "a".into(),
                requested_expiry_ms: None,
                keep_alive: false,
                timeout_time: None,
                created_time: current_timestamp(),
            })
            .await
            .unwrap();
        let state = store.try_assign("r", "a", Some(60_000)).await.unwrap();
        assert!(state.is_some());
        assert!(store.requests_for_resource("r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_drops_timed_out_requests() {
        let store = MemoryLockPersistService::new();
        store.try_assign("r", "a", None).await.unwrap();
        let now = current_timestamp();
        store
            .insert_request(NewLockRequest {
                resource: "r".into(),
                requester: "b".into(),
                requested_expiry_ms: None,
                keep_alive: false,
                timeout_time: Some(now - 1),
                created_time: now - 10_000,
            })
            .await
            .unwrap();
        store.reconcile_resource("r").await.unwrap();
        assert!(store.requests_for_resource("r").await.unwrap().is_empty());
        // The live hold is untouched.
        let state = store.get_state("r", false).await.unwrap().unwrap();
        assert!(state.is_held_by("a"));
    }

    #[tokio::test]
    async fn test_reconcile_clears_expired_hold_with_empty_queue() {
        let store = MemoryLockPersistService::new();
        store.try_assign("r", "a", Some(-1)).await.unwrap();
        let state = store.reconcile_resource("r").await.unwrap().unwrap();
        assert!(state.holder.is_none());
    }

    // Assignment takes the lock table before the request table; search and
    // maintenance must do the same, or two threads can block each other
    // forever holding one table each.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assign_and_search_make_progress() {
        let store = Arc::new(MemoryLockPersistService::new());
        let assigner = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    store.try_assign("r", "a", None).await.unwrap();
                    store.unlock_if_held("r", "a").await.unwrap();
                }
            })
        };
        let searcher = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    store.search(&QueryCriteria::new()).await.unwrap();
                    store.delete_inactive(None).await.unwrap();
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            assigner.await.unwrap();
            searcher.await.unwrap();
        })
        .await
        .expect("store operations should not block each other");
    }

    #[tokio::test]
    async fn test_delete_inactive_spares_busy_rows() {
        let store = MemoryLockPersistService::new();
        store.try_assign("held", "a", None).await.unwrap();
        store.try_assign("idle", "a", None).await.unwrap();
        store.unlock_if_held("idle", "a").await.unwrap();

        let removed = store.delete_inactive(None).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_locks().await.unwrap(), 1);
        assert!(store.get_state("held", false).await.unwrap().is_some());
    }
}
