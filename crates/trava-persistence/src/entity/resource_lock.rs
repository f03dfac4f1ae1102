//! `SeaORM` Entity for resource_lock table
//!
//! One row per distinct resource key; the `resource` column stores the
//! canonical lower-cased key. All time columns are Unix milliseconds.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "resource_lock")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub resource: String,
    pub holder: Option<String>,
    pub locked_time: Option<i64>,
    pub last_lock_time: Option<i64>,
    pub expiry_time: Option<i64>,
    pub created_time: i64,
    pub modified_time: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
