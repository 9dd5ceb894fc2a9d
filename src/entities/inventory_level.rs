use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock position of one variant. `quantity_reserved <= quantity_on_hand`
/// holds after every committed mutation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_levels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub variant_id: Uuid,
    pub quantity_on_hand: i32,
    pub quantity_reserved: i32,
    pub reorder_level: i32,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn available(&self) -> i32 {
        (self.quantity_on_hand - self.quantity_reserved).max(0)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
