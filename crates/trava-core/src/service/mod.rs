//! Lock coordination services.

pub mod distributed;
pub mod handle;
pub mod local;
pub mod provider;
pub mod scheduler;
