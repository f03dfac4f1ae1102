//! Trava Persistence - Lock store entities and SQL backend
//!
//! This crate provides:
//! - SeaORM entity definitions for the lock tables
//! - The `LockPersistence` storage collaborator contract
//! - The external-database implementation of that contract
//! - An in-memory implementation for tests and single-process use

pub mod entity;
pub mod memory;
pub mod model;
pub mod sql;
pub mod traits;

// Re-export sea-orm for convenience
pub use sea_orm;

// Re-export entity prelude
pub use entity::prelude::*;

// Re-export the storage contract
pub use traits::LockPersistence;

// Re-export store backends
pub use memory::MemoryLockPersistService;
pub use sql::ExternalDbLockPersistService;

// Re-export row/domain conversions
pub use model::{request_from_row, state_from_row};
