use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::product_variant::{self, Entity as ProductVariantEntity};
use crate::errors::ServiceError;

/// What the checkout needs to know about a sellable variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub live_price: Decimal,
    pub weight_grams: i32,
}

impl From<product_variant::Model> for VariantInfo {
    fn from(model: product_variant::Model) -> Self {
        Self {
            variant_id: model.id,
            product_id: model.product_id,
            sku: model.sku,
            name: model.name,
            live_price: model.price,
            weight_grams: model.weight_grams,
        }
    }
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// Active variant by id; `None` when unknown or withdrawn from sale.
    async fn get_variant(&self, variant_id: Uuid) -> Result<Option<VariantInfo>, ServiceError>;

    async fn get_variants(
        &self,
        variant_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, VariantInfo>, ServiceError> {
        let mut found = HashMap::with_capacity(variant_ids.len());
        for id in variant_ids {
            if let Some(variant) = self.get_variant(*id).await? {
                found.insert(*id, variant);
            }
        }
        Ok(found)
    }
}

/// Catalog backed by the `product_variants` table.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogLookup for DbCatalog {
    async fn get_variant(&self, variant_id: Uuid) -> Result<Option<VariantInfo>, ServiceError> {
        let variant = ProductVariantEntity::find_by_id(variant_id)
            .filter(product_variant::Column::Active.eq(true))
            .one(&*self.db)
            .await?;
        Ok(variant.map(VariantInfo::from))
    }

    async fn get_variants(
        &self,
        variant_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, VariantInfo>, ServiceError> {
        let variants = ProductVariantEntity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids.iter().copied()))
            .filter(product_variant::Column::Active.eq(true))
            .all(&*self.db)
            .await?;
        Ok(variants
            .into_iter()
            .map(|v| (v.id, VariantInfo::from(v)))
            .collect())
    }
}
