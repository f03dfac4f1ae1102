//! `SeaORM` entity definitions for the lock store.

pub mod lock_request;
pub mod resource_lock;

pub mod prelude {
    pub use super::lock_request::Entity as LockRequest;
    pub use super::resource_lock::Entity as ResourceLock;
}
