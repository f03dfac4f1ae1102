//! Test support for the Trava integration suite.
//!
//! Both lock strategies are exercised through the same scenarios; the
//! helpers here build providers with intervals short enough for tests.

use std::sync::Arc;

use trava_common::model::{CleanupPolicy, LockManagerConfig};
use trava_core::{DatabaseLockProvider, LocalLockProvider, LockProvider};
use trava_persistence::MemoryLockPersistService;

/// Configuration with fast reconciliation polling and cleanup disabled, so
/// scenarios observe only what they drive themselves.
pub fn fast_config() -> LockManagerConfig {
    LockManagerConfig {
        cleanup_policy: CleanupPolicy::Disabled,
        request_poll_interval_ms: 20,
        renewal_offset_ms: 40,
        ..LockManagerConfig::default()
    }
}

pub fn local_provider() -> Arc<dyn LockProvider> {
    Arc::new(LocalLockProvider::new(fast_config()))
}

pub fn database_provider() -> Arc<dyn LockProvider> {
    Arc::new(DatabaseLockProvider::new(
        Arc::new(MemoryLockPersistService::new()),
        fast_config(),
    ))
}
