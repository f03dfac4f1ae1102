//! Row/domain conversions for the lock store.

use trava_common::model::{PendingRequestInfo, ResourceLockState};

use crate::entity::{lock_request, resource_lock};

/// Convert a lock row plus its derived pending count into a snapshot.
pub fn state_from_row(row: &resource_lock::Model, pending_request_count: u64) -> ResourceLockState {
    ResourceLockState {
        resource: row.resource.clone(),
        holder: row.holder.clone(),
        locked_at: row.locked_time,
        last_lock_date: row.last_lock_time,
        expiry_date: row.expiry_time,
        pending_request_count,
    }
}

pub fn request_from_row(row: &lock_request::Model) -> PendingRequestInfo {
    PendingRequestInfo {
        id: row.id,
        resource: row.resource.clone(),
        requester: row.requester.clone(),
        requested_expiry_ms: row.requested_expiry_ms,
        keep_alive: row.keep_alive,
        timeout_time: row.timeout_time,
        created_time: row.created_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_row_carries_pending_count() {
        let row = resource_lock::Model {
            id: 1,
            resource: "jobs.nightly".to_string(),
            holder: Some("worker-1".to_string()),
            locked_time: Some(100),
            last_lock_time: Some(100),
            expiry_time: None,
            created_time: 50,
            modified_time: 100,
        };
        let state = state_from_row(&row, 3);
        assert_eq!(state.resource, "jobs.nightly");
        assert_eq!(state.holder.as_deref(), Some("worker-1"));
        assert_eq!(state.pending_request_count, 3);
    }

    #[test]
    fn test_request_from_row() {
        let row = lock_request::Model {
            id: 7,
            resource: "r".to_string(),
            requester: "a".to_string(),
            requested_expiry_ms: Some(5_000),
            keep_alive: true,
            timeout_time: None,
            created_time: 42,
        };
        let info = request_from_row(&row);
        assert_eq!(info.id, 7);
        assert!(info.keep_alive);
        assert_eq!(info.requested_expiry_ms, Some(5_000));
    }
}
