//! SQL-based lock store (MySQL/PostgreSQL via SeaORM)
//!
//! Implements `LockPersistence` against a relational database. Assignment,
//! unlock and extension each run inside a transaction that takes the lock
//! row `FOR UPDATE`, so the database's row locking is the mutual-exclusion
//! boundary between processes.

use std::collections::{HashMap, HashSet};

use sea_orm::*;
use tracing::debug;

use async_trait::async_trait;
use trava_common::model::{
    NewLockRequest, Page, PendingRequestInfo, QueryCriteria, ResourceLockState,
};
use trava_common::query;
use trava_common::utils::{current_timestamp, identifier_eq};

use crate::entity::{lock_request, resource_lock};
use crate::model::{request_from_row, state_from_row};
use crate::traits::LockPersistence;

/// External database lock store.
///
/// Wraps a SeaORM `DatabaseConnection`; one instance is shared by the
/// coordinator and its reconciliation workers.
pub struct ExternalDbLockPersistService {
    db: DatabaseConnection,
}

impl ExternalDbLockPersistService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Escape SQL wildcard characters in a user-supplied fragment.
#[inline]
fn escape_sql_like_pattern(input: &str) -> String {
    input.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn is_live_hold(row: &resource_lock::Model, now: i64) -> bool {
    row.holder.is_some() && !row.expiry_time.is_some_and(|e| now >= e)
}

fn held_by(row: &resource_lock::Model, requester: &str, now: i64) -> bool {
    is_live_hold(row, now)
        && row
            .holder
            .as_deref()
            .is_some_and(|h| identifier_eq(h, requester))
}

async fn fetch_row_for_update<C: ConnectionTrait>(
    conn: &C,
    resource: &str,
) -> anyhow::Result<Option<resource_lock::Model>> {
    Ok(resource_lock::Entity::find()
        .filter(resource_lock::Column::Resource.eq(resource))
        .lock_exclusive()
        .one(conn)
        .await?)
}

async fn fetch_requests_ordered<C: ConnectionTrait>(
    conn: &C,
    resource: &str,
) -> anyhow::Result<Vec<lock_request::Model>> {
    Ok(lock_request::Entity::find()
        .filter(lock_request::Column::Resource.eq(resource))
        .order_by_asc(lock_request::Column::CreatedTime)
        .order_by_asc(lock_request::Column::Id)
        .all(conn)
        .await?)
}

/// Write the granted hold into the row, inserting it if the resource has
/// never been locked before.
async fn write_grant<C: ConnectionTrait>(
    conn: &C,
    row: Option<resource_lock::Model>,
    resource: &str,
    requester: &str,
    expiry_time: Option<i64>,
    now: i64,
) -> anyhow::Result<resource_lock::Model> {
    let updated = match row {
        Some(existing) => {
            let mut active: resource_lock::ActiveModel = existing.into();
            active.holder = Set(Some(requester.to_string()));
            active.locked_time = Set(Some(now));
            active.last_lock_time = Set(Some(now));
            active.expiry_time = Set(expiry_time);
            active.modified_time = Set(now);
            active.update(conn).await?
        }
        None => {
            let active = resource_lock::ActiveModel {
                id: NotSet,
                resource: Set(resource.to_string()),
                holder: Set(Some(requester.to_string())),
                locked_time: Set(Some(now)),
                last_lock_time: Set(Some(now)),
                expiry_time: Set(expiry_time),
                created_time: Set(now),
                modified_time: Set(now),
            };
            active.insert(conn).await?
        }
    };
    Ok(updated)
}

async fn clear_hold<C: ConnectionTrait>(
    conn: &C,
    row: resource_lock::Model,
    now: i64,
) -> anyhow::Result<resource_lock::Model> {
    let mut active: resource_lock::ActiveModel = row.into();
    active.holder = Set(None);
    active.locked_time = Set(None);
    active.expiry_time = Set(None);
    active.modified_time = Set(now);
    Ok(active.update(conn).await?)
}

// ============================================================================
// LockPersistence implementation
// ============================================================================

#[async_trait]
impl LockPersistence for ExternalDbLockPersistService {
    async fn get_state(
        &self,
        resource: &str,
        include_pending: bool,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let row = resource_lock::Entity::find()
            .filter(resource_lock::Column::Resource.eq(resource))
            .one(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let pending = if include_pending {
            lock_request::Entity::find()
                .filter(lock_request::Column::Resource.eq(resource))
                .count(&self.db)
                .await?
        } else {
            0
        };
        Ok(Some(state_from_row(&row, pending)))
    }

    async fn try_assign(
        &self,
        resource: &str,
        requester: &str,
        expiry_ms: Option<i64>,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let now = current_timestamp();
        let tx = self.db.begin().await?;

        let row = fetch_row_for_update(&tx, resource).await?;
        let renewal = row.as_ref().is_some_and(|r| held_by(r, requester, now));

        if !renewal {
            if row.as_ref().is_some_and(|r| is_live_hold(r, now)) {
                return Ok(None);
            }
            // Queued requests from other requesters keep their priority over
            // a direct caller observing the free/expired transition.
            let queued = fetch_requests_ordered(&tx, resource).await?;
            let blocked = queued.iter().any(|q| {
                !q.timeout_time.is_some_and(|t| now >= t) && !identifier_eq(&q.requester, requester)
            });
            if blocked {
                return Ok(None);
            }
        }

        let expiry_time = expiry_ms.map(|ms| now + ms);
        let updated = write_grant(&tx, row, resource, requester, expiry_time, now).await?;

        // A direct grant supersedes the caller's own queued requests.
        let superseded: Vec<i64> = fetch_requests_ordered(&tx, resource)
            .await?
            .iter()
            .filter(|q| identifier_eq(&q.requester, requester))
            .map(|q| q.id)
            .collect();
        if !superseded.is_empty() {
            lock_request::Entity::delete_many()
                .filter(lock_request::Column::Id.is_in(superseded))
                .exec(&tx)
                .await?;
        }

        let pending = lock_request::Entity::find()
            .filter(lock_request::Column::Resource.eq(resource))
            .count(&tx)
            .await?;
        tx.commit().await?;

        debug!(resource = %resource, requester = %requester, "lock assigned");
        Ok(Some(state_from_row(&updated, pending)))
    }

    async fn unlock_if_held(&self, resource: &str, holder: &str) -> anyhow::Result<bool> {
        let now = current_timestamp();
        let tx = self.db.begin().await?;

        let Some(row) = fetch_row_for_update(&tx, resource).await? else {
            return Ok(false);
        };
        if !held_by(&row, holder, now) {
            return Ok(false);
        }

        clear_hold(&tx, row, now).await?;
        tx.commit().await?;
        debug!(resource = %resource, holder = %holder, "lock released");
        Ok(true)
    }

    async fn try_extend(
        &self,
        resource: &str,
        holder: &str,
        extend_ms: i64,
    ) -> anyhow::Result<Option<i64>> {
        let now = current_timestamp();
        let tx = self.db.begin().await?;

        let Some(row) = fetch_row_for_update(&tx, resource).await? else {
            return Ok(None);
        };
        if !held_by(&row, holder, now) {
            return Ok(None);
        }

        let new_expiry = now + extend_ms;
        let mut active: resource_lock::ActiveModel = row.into();
        active.expiry_time = Set(Some(new_expiry));
        active.modified_time = Set(now);
        active.update(&tx).await?;
        tx.commit().await?;
        Ok(Some(new_expiry))
    }

    async fn insert_request(&self, request: NewLockRequest) -> anyhow::Result<i64> {
        let active = lock_request::ActiveModel {
            id: NotSet,
            resource: Set(request.resource),
            requester: Set(request.requester),
            requested_expiry_ms: Set(request.requested_expiry_ms),
            keep_alive: Set(request.keep_alive),
            timeout_time: Set(request.timeout_time),
            created_time: Set(request.created_time),
        };
        let inserted = active.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn delete_requests(&self, ids: &[i64]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = lock_request::Entity::delete_many()
            .filter(lock_request::Column::Id.is_in(ids.to_vec()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn requests_for_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Vec<PendingRequestInfo>> {
        let rows = fetch_requests_ordered(&self.db, resource).await?;
        Ok(rows.iter().map(request_from_row).collect())
    }

    async fn requests_by_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<PendingRequestInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = lock_request::Entity::find()
            .filter(lock_request::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await?;
        Ok(rows.iter().map(request_from_row).collect())
    }

    async fn deleted_request_ids(&self, ids: &[i64]) -> anyhow::Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let existing: HashSet<i64> = lock_request::Entity::find()
            .select_only()
            .column(lock_request::Column::Id)
            .filter(lock_request::Column::Id.is_in(ids.to_vec()))
            .into_tuple::<i64>()
            .all(&self.db)
            .await?
            .into_iter()
            .collect();
        Ok(ids.iter().copied().filter(|id| !existing.contains(id)).collect())
    }

    async fn resources_with_pending_requests(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(lock_request::Entity::find()
            .select_only()
            .column(lock_request::Column::Resource)
            .distinct()
            .limit(limit as u64)
            .into_tuple::<String>()
            .all(&self.db)
            .await?)
    }

    async fn reconcile_resource(
        &self,
        resource: &str,
    ) -> anyhow::Result<Option<ResourceLockState>> {
        let now = current_timestamp();
        let tx = self.db.begin().await?;

        let row = fetch_row_for_update(&tx, resource).await?;
        let queued = fetch_requests_ordered(&tx, resource).await?;

        let (timed_out, live): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .partition(|q| q.timeout_time.is_some_and(|t| now >= t));
        let mut deleted_ids: Vec<i64> = timed_out.iter().map(|q| q.id).collect();

        let grantable = row
            .as_ref()
            .is_none_or(|r| r.holder.is_none() || !is_live_hold(r, now));

        let mut updated_row = None;
        if grantable {
            if let Some(head) = live.first() {
                let expiry_time = head.requested_expiry_ms.map(|ms| now + ms);
                let granted =
                    write_grant(&tx, row, resource, &head.requester, expiry_time, now).await?;
                deleted_ids.push(head.id);
                // Requests superseded by the new holder's own grant.
                deleted_ids.extend(
                    live.iter()
                        .skip(1)
                        .filter(|q| identifier_eq(&q.requester, &head.requester))
                        .map(|q| q.id),
                );
                debug!(resource = %resource, requester = %head.requester, "queued request assigned");
                updated_row = Some(granted);
            } else if let Some(r) = row
                && r.holder.is_some()
            {
                // Expired hold with nothing queued: just clear the holder.
                updated_row = Some(clear_hold(&tx, r, now).await?);
            }
        }

        if updated_row.is_none() && deleted_ids.is_empty() {
            return Ok(None);
        }

        if !deleted_ids.is_empty() {
            lock_request::Entity::delete_many()
                .filter(lock_request::Column::Id.is_in(deleted_ids))
                .exec(&tx)
                .await?;
        }

        let snapshot = match &updated_row {
            Some(r) => {
                let pending = lock_request::Entity::find()
                    .filter(lock_request::Column::Resource.eq(resource))
                    .count(&tx)
                    .await?;
                Some(state_from_row(r, pending))
            }
            None => None,
        };
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn force_release(&self, resource: &str, remove_requests: bool) -> anyhow::Result<()> {
        let now = current_timestamp();
        let tx = self.db.begin().await?;

        if let Some(row) = fetch_row_for_update(&tx, resource).await?
            && row.holder.is_some()
        {
            clear_hold(&tx, row, now).await?;
        }
        if remove_requests {
            lock_request::Entity::delete_many()
                .filter(lock_request::Column::Resource.eq(resource))
                .exec(&tx)
                .await?;
        }
        tx.commit().await?;
        debug!(resource = %resource, remove_requests, "force released");
        Ok(())
    }

    async fn search(&self, criteria: &QueryCriteria) -> anyhow::Result<Page<ResourceLockState>> {
        let mut select = resource_lock::Entity::find();
        if let Some(fragment) = &criteria.resource_contains {
            // Coarse SQL prefilter; exact semantics applied by the shared
            // query engine below.
            let pattern = format!("%{}%", escape_sql_like_pattern(&fragment.to_lowercase()));
            select = select.filter(resource_lock::Column::Resource.like(pattern));
        }
        let rows = select.all(&self.db).await?;

        let counts: HashMap<String, u64> = lock_request::Entity::find()
            .select_only()
            .column(lock_request::Column::Resource)
            .column_as(lock_request::Column::Id.count(), "request_count")
            .group_by(lock_request::Column::Resource)
            .into_tuple::<(String, i64)>()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|(resource, count)| (resource, count.max(0) as u64))
            .collect();

        let items: Vec<ResourceLockState> = rows
            .iter()
            .map(|row| state_from_row(row, counts.get(&row.resource).copied().unwrap_or(0)))
            .collect();
        Ok(query::apply(criteria, items, current_timestamp()))
    }

    async fn delete_inactive(&self, older_than_ms: Option<i64>) -> anyhow::Result<u64> {
        let now = current_timestamp();
        let busy: Vec<String> = lock_request::Entity::find()
            .select_only()
            .column(lock_request::Column::Resource)
            .distinct()
            .into_tuple::<String>()
            .all(&self.db)
            .await?;

        let mut delete = lock_request_free_locks();
        if !busy.is_empty() {
            delete = delete.filter(resource_lock::Column::Resource.is_not_in(busy));
        }
        if let Some(age) = older_than_ms {
            let cutoff = now - age;
            delete = delete.filter(
                Condition::any()
                    .add(resource_lock::Column::LastLockTime.lt(cutoff))
                    .add(
                        Condition::all()
                            .add(resource_lock::Column::LastLockTime.is_null())
                            .add(resource_lock::Column::CreatedTime.lt(cutoff)),
                    ),
            );
        }
        let result = delete.exec(&self.db).await?;
        if result.rows_affected > 0 {
            debug!(count = result.rows_affected, "inactive lock rows removed");
        }
        Ok(result.rows_affected)
    }

    async fn count_locks(&self) -> anyhow::Result<u64> {
        Ok(resource_lock::Entity::find().count(&self.db).await?)
    }
}

fn lock_request_free_locks() -> DeleteMany<resource_lock::Entity> {
    resource_lock::Entity::delete_many().filter(resource_lock::Column::Holder.is_null())
}
