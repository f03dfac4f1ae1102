//! Snapshot query engine
//!
//! Applies `QueryCriteria` to a set of lock snapshots: filters compose with
//! logical AND, sorting is a stable multi-key sort, pagination is 1-based.
//! Both lock strategies (and the SQL search) run their results through this
//! engine so the semantics cannot drift apart.

use std::cmp::Ordering;

use crate::model::{ExpiryFilter, LockSortField, Page, QueryCriteria, ResourceLockState};
use crate::utils::identifier_eq;

/// Whether `state` matches every filter of `criteria` at time `now`.
pub fn matches(criteria: &QueryCriteria, state: &ResourceLockState, now: i64) -> bool {
    if let Some(fragment) = &criteria.resource_contains
        && !contains_ignore_case(&state.resource, fragment)
    {
        return false;
    }

    if let Some(fragment) = &criteria.holder_contains {
        match &state.holder {
            Some(holder) if contains_ignore_case(holder, fragment) => {}
            _ => return false,
        }
    }

    if let Some(wanted) = &criteria.holder_equals {
        match (wanted, &state.holder) {
            (None, None) => {}
            (Some(expected), Some(holder)) if identifier_eq(expected, holder) => {}
            _ => return false,
        }
    }

    if let Some(threshold) = criteria.pending_requests_greater_than
        && state.pending_request_count <= threshold
    {
        return false;
    }

    // A hold without an expiry date matches neither expiry filter.
    if let Some(filter) = criteria.expiry {
        match state.expiry_date {
            Some(expiry) => match filter {
                ExpiryFilter::OnlyExpired if now >= expiry => {}
                ExpiryFilter::OnlyNotExpired if now < expiry => {}
                _ => return false,
            },
            None => return false,
        }
    }

    true
}

/// Filter, sort and paginate `items`, returning the requested page and the
/// true total matching count independent of pagination.
pub fn apply(
    criteria: &QueryCriteria,
    items: Vec<ResourceLockState>,
    now: i64,
) -> Page<ResourceLockState> {
    let mut matched: Vec<ResourceLockState> = items
        .into_iter()
        .filter(|state| matches(criteria, state, now))
        .collect();

    if !criteria.sort.is_empty() {
        // Vec::sort_by is stable, so equal keys keep their prior order.
        matched.sort_by(|a, b| {
            for key in &criteria.sort {
                let ordering = compare_field(a, b, key.field);
                let ordering = if key.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    paginate(criteria, matched)
}

/// Apply only the pagination step to an already filtered and sorted set.
pub fn paginate(criteria: &QueryCriteria, matched: Vec<ResourceLockState>) -> Page<ResourceLockState> {
    if criteria.page <= 0 {
        return Page::all(matched);
    }

    let total = matched.len() as u64;
    let start = (criteria.page as u64 - 1).saturating_mul(criteria.page_size);
    let page_items: Vec<ResourceLockState> = matched
        .into_iter()
        .skip(start as usize)
        .take(criteria.page_size as usize)
        .collect();

    Page::new(total, criteria.page as u64, criteria.page_size, page_items)
}

// Missing optional values sort before any present value.
fn compare_field(a: &ResourceLockState, b: &ResourceLockState, field: LockSortField) -> Ordering {
    match field {
        LockSortField::Resource => a.resource.cmp(&b.resource),
        LockSortField::Holder => cmp_opt_str(&a.holder, &b.holder),
        LockSortField::LockedAt => a.locked_at.cmp(&b.locked_at),
        LockSortField::LastLockDate => a.last_lock_date.cmp(&b.last_lock_date),
        LockSortField::ExpiryDate => a.expiry_date.cmp(&b.expiry_date),
        LockSortField::PendingRequestCount => {
            a.pending_request_count.cmp(&b.pending_request_count)
        }
    }
}

fn cmp_opt_str(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
