//! `SeaORM` Entity for lock_request table
//!
//! One row per persisted pending acquire request. Rows are deleted when the
//! request reaches a terminal resolution (assigned, timed out, removed).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "lock_request")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub resource: String,
    pub requester: String,
    pub requested_expiry_ms: Option<i64>,
    pub keep_alive: bool,
    pub timeout_time: Option<i64>,
    pub created_time: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
