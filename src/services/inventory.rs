//! Inventory ledger: on-hand and reserved quantities per variant.
//!
//! Every mutation locks the level row (`SELECT ... FOR UPDATE` where the
//! backend supports it) and writes it back with a compare-and-swap on the
//! quantities it read, so a concurrent writer is detected on any backend.
//! A lost race surfaces as `TransientInfra` and is retried by callers through
//! `db::with_transient_retry`.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::with_transient_retry;
use crate::entities::{
    inventory_level::{self, Entity as InventoryLevelEntity},
    inventory_reservation::{self, Entity as ReservationEntity, ReservationStatus},
};
use crate::errors::ServiceError;

/// One variant-quantity hold requested for an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationLine {
    pub variant_id: Uuid,
    /// Shown to the shopper when stock runs short
    pub product_name: String,
    pub quantity: i32,
}

#[derive(Clone)]
pub struct InventoryLedger {
    db: Arc<DatabaseConnection>,
    lock_retries: u32,
}

impl InventoryLedger {
    pub fn new(db: Arc<DatabaseConnection>, lock_retries: u32) -> Self {
        Self { db, lock_retries }
    }

    pub fn lock_retries(&self) -> u32 {
        self.lock_retries
    }

    /// On-hand minus reserved. Advisory only: the value may be stale by the
    /// time the caller acts on it. Unknown variants have no stock.
    pub async fn available_stock(&self, variant_id: Uuid) -> Result<i32, ServiceError> {
        let level = InventoryLevelEntity::find_by_id(variant_id)
            .one(&*self.db)
            .await?;
        Ok(level.map(|l| l.available()).unwrap_or(0))
    }

    /// Advisory availability for several variants in one query.
    pub async fn available_stock_many(
        &self,
        variant_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, i32>, ServiceError> {
        let levels = InventoryLevelEntity::find()
            .filter(inventory_level::Column::VariantId.is_in(variant_ids.iter().copied()))
            .all(&*self.db)
            .await?;
        let mut available: HashMap<Uuid, i32> = variant_ids.iter().map(|id| (*id, 0)).collect();
        for level in levels {
            available.insert(level.variant_id, level.available());
        }
        Ok(available)
    }

    pub async fn level(&self, variant_id: Uuid) -> Result<Option<inventory_level::Model>, ServiceError> {
        Ok(InventoryLevelEntity::find_by_id(variant_id)
            .one(&*self.db)
            .await?)
    }

    /// Sets the on-hand quantity of a variant, creating the level if needed.
    /// On-hand may not drop below what is already reserved.
    #[instrument(skip(self))]
    pub async fn set_stock(
        &self,
        variant_id: Uuid,
        quantity_on_hand: i32,
        reorder_level: i32,
    ) -> Result<inventory_level::Model, ServiceError> {
        if quantity_on_hand < 0 || reorder_level < 0 {
            return Err(ServiceError::ValidationError(
                "Stock quantities must not be negative".to_string(),
            ));
        }

        with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            let now = Utc::now();
            let existing = lock_level(&txn, variant_id).await?;
            let saved = match existing {
                Some(level) => {
                    if quantity_on_hand < level.quantity_reserved {
                        return Err(ServiceError::Conflict(format!(
                            "Cannot set on-hand to {} while {} units are reserved",
                            quantity_on_hand, level.quantity_reserved
                        )));
                    }
                    swap_level(&txn, &level, quantity_on_hand, level.quantity_reserved).await?;
                    InventoryLevelEntity::update_many()
                        .set(inventory_level::ActiveModel {
                            reorder_level: Set(reorder_level),
                            ..Default::default()
                        })
                        .filter(inventory_level::Column::VariantId.eq(variant_id))
                        .exec(&txn)
                        .await?;
                    inventory_level::Model {
                        quantity_on_hand,
                        reorder_level,
                        updated_at: now,
                        ..level
                    }
                }
                None => {
                    let created = inventory_level::ActiveModel {
                        variant_id: Set(variant_id),
                        quantity_on_hand: Set(quantity_on_hand),
                        quantity_reserved: Set(0),
                        reorder_level: Set(reorder_level),
                        updated_at: Set(now),
                    };
                    InventoryLevelEntity::insert(created)
                        .exec_without_returning(&txn)
                        .await?;
                    inventory_level::Model {
                        variant_id,
                        quantity_on_hand,
                        quantity_reserved: 0,
                        reorder_level,
                        updated_at: now,
                    }
                }
            };
            txn.commit().await?;
            Ok(saved)
        })
        .await
    }

    /// Reserves every line for `order_id` in its own transaction.
    pub async fn reserve(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            match self.reserve_in(&txn, order_id, lines).await {
                Ok(reservations) => {
                    txn.commit().await?;
                    Ok(reservations)
                }
                Err(err) => {
                    txn.rollback().await?;
                    Err(err)
                }
            }
        })
        .await
    }

    /// Reserves every line inside the caller's transaction. On error nothing
    /// from this call may be committed: the caller must roll back.
    #[instrument(skip(self, txn, lines), fields(order_id = %order_id, lines = lines.len()))]
    pub async fn reserve_in(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        lines: &[ReservationLine],
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        let merged = merge_lines(lines)?;
        let now = Utc::now();
        let mut reservations = Vec::with_capacity(merged.len());

        // Locks are taken in variant-id order so two orders sharing variants
        // cannot deadlock on each other.
        for (variant_id, line) in merged {
            let level = lock_level(txn, variant_id).await?;
            let (on_hand, reserved, available) = level
                .as_ref()
                .map(|l| (l.quantity_on_hand, l.quantity_reserved, l.available()))
                .unwrap_or((0, 0, 0));

            if available < line.quantity {
                counter!("inventory.stock_conflicts", 1);
                warn!(
                    %variant_id,
                    available,
                    requested = line.quantity,
                    "Insufficient stock for reservation"
                );
                return Err(ServiceError::InsufficientStock {
                    product_name: line.product_name,
                    available,
                    requested: line.quantity,
                });
            }

            if let Some(level) = &level {
                swap_level(txn, level, on_hand, reserved + line.quantity).await?;
            }

            let reservation = inventory_reservation::Model {
                id: Uuid::new_v4(),
                order_id,
                variant_id,
                quantity: line.quantity,
                status: ReservationStatus::Active,
                reserved_at: now,
                released_at: None,
                sold_at: None,
            };
            ReservationEntity::insert(inventory_reservation::ActiveModel {
                id: Set(reservation.id),
                order_id: Set(order_id),
                variant_id: Set(variant_id),
                quantity: Set(line.quantity),
                status: Set(ReservationStatus::Active),
                reserved_at: Set(now),
                released_at: Set(None),
                sold_at: Set(None),
            })
            .exec_without_returning(txn)
            .await?;
            reservations.push(reservation);
        }

        counter!("inventory.reservations.created", reservations.len() as u64);
        debug!(count = reservations.len(), "Reserved inventory");
        Ok(reservations)
    }

    /// Releases all active reservations of `order_id`. Re-running it on an
    /// order with nothing active changes nothing.
    pub async fn release(&self, order_id: Uuid) -> Result<usize, ServiceError> {
        with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            let released = self.release_in(&txn, order_id).await?;
            txn.commit().await?;
            Ok(released)
        })
        .await
    }

    #[instrument(skip(self, txn), fields(order_id = %order_id))]
    pub async fn release_in(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let active = reservations_with_status(txn, order_id, ReservationStatus::Active).await?;
        let mut released = 0;

        for reservation in active {
            if !mark_reservation(
                txn,
                &reservation,
                ReservationStatus::Active,
                inventory_reservation::ActiveModel {
                    status: Set(ReservationStatus::Released),
                    released_at: Set(Some(now)),
                    ..Default::default()
                },
            )
            .await?
            {
                continue;
            }

            if let Some(level) = lock_level(txn, reservation.variant_id).await? {
                let reserved = (level.quantity_reserved - reservation.quantity).max(0);
                swap_level(txn, &level, level.quantity_on_hand, reserved).await?;
            }
            released += 1;
        }

        if released > 0 {
            counter!("inventory.reservations.released", released as u64);
            info!(released, "Released inventory reservations");
        }
        Ok(released)
    }

    /// Goods left the warehouse: on-hand and reserved both drop by the held
    /// quantity.
    pub async fn confirm_sold(&self, order_id: Uuid) -> Result<usize, ServiceError> {
        with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            let sold = self.confirm_sold_in(&txn, order_id).await?;
            txn.commit().await?;
            Ok(sold)
        })
        .await
    }

    #[instrument(skip(self, txn), fields(order_id = %order_id))]
    pub async fn confirm_sold_in(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let active = reservations_with_status(txn, order_id, ReservationStatus::Active).await?;
        let mut sold = 0;

        for reservation in active {
            if !mark_reservation(
                txn,
                &reservation,
                ReservationStatus::Active,
                inventory_reservation::ActiveModel {
                    status: Set(ReservationStatus::Sold),
                    sold_at: Set(Some(now)),
                    ..Default::default()
                },
            )
            .await?
            {
                continue;
            }

            if let Some(level) = lock_level(txn, reservation.variant_id).await? {
                let on_hand = (level.quantity_on_hand - reservation.quantity).max(0);
                let reserved = (level.quantity_reserved - reservation.quantity)
                    .max(0)
                    .min(on_hand);
                swap_level(txn, &level, on_hand, reserved).await?;
            }
            sold += 1;
        }

        Ok(sold)
    }

    /// Undoes `confirm_sold` for a returned shipment; the holds become
    /// active again so a following release frees the stock.
    pub async fn revert_sold(&self, order_id: Uuid) -> Result<usize, ServiceError> {
        with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            let reverted = self.revert_sold_in(&txn, order_id).await?;
            txn.commit().await?;
            Ok(reverted)
        })
        .await
    }

    #[instrument(skip(self, txn), fields(order_id = %order_id))]
    pub async fn revert_sold_in(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<usize, ServiceError> {
        let sold = reservations_with_status(txn, order_id, ReservationStatus::Sold).await?;
        let mut reverted = 0;

        for reservation in sold {
            if !mark_reservation(
                txn,
                &reservation,
                ReservationStatus::Sold,
                inventory_reservation::ActiveModel {
                    status: Set(ReservationStatus::Active),
                    sold_at: Set(None),
                    ..Default::default()
                },
            )
            .await?
            {
                continue;
            }

            match lock_level(txn, reservation.variant_id).await? {
                Some(level) => {
                    swap_level(
                        txn,
                        &level,
                        level.quantity_on_hand + reservation.quantity,
                        level.quantity_reserved + reservation.quantity,
                    )
                    .await?;
                }
                None => {
                    InventoryLevelEntity::insert(inventory_level::ActiveModel {
                        variant_id: Set(reservation.variant_id),
                        quantity_on_hand: Set(reservation.quantity),
                        quantity_reserved: Set(reservation.quantity),
                        reorder_level: Set(0),
                        updated_at: Set(Utc::now()),
                    })
                    .exec_without_returning(txn)
                    .await?;
                }
            }
            reverted += 1;
        }

        Ok(reverted)
    }

    /// Every reservation ever taken for an order, oldest first.
    pub async fn reservations_for(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
        Ok(ReservationEntity::find()
            .filter(inventory_reservation::Column::OrderId.eq(order_id))
            .order_by_asc(inventory_reservation::Column::ReservedAt)
            .all(&*self.db)
            .await?)
    }
}

/// Folds duplicate variants together and orders them by id.
fn merge_lines(lines: &[ReservationLine]) -> Result<BTreeMap<Uuid, ReservationLine>, ServiceError> {
    let mut merged: BTreeMap<Uuid, ReservationLine> = BTreeMap::new();
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity for {} must be positive",
                line.product_name
            )));
        }
        merged
            .entry(line.variant_id)
            .and_modify(|existing| existing.quantity += line.quantity)
            .or_insert_with(|| line.clone());
    }
    Ok(merged)
}

async fn lock_level(
    txn: &DatabaseTransaction,
    variant_id: Uuid,
) -> Result<Option<inventory_level::Model>, ServiceError> {
    Ok(InventoryLevelEntity::find_by_id(variant_id)
        .lock_exclusive()
        .one(txn)
        .await?)
}

/// Writes new quantities only if the row still holds the ones read under
/// the lock.
async fn swap_level(
    txn: &DatabaseTransaction,
    level: &inventory_level::Model,
    quantity_on_hand: i32,
    quantity_reserved: i32,
) -> Result<(), ServiceError> {
    if quantity_reserved > quantity_on_hand || quantity_reserved < 0 {
        return Err(ServiceError::InternalError(format!(
            "Refusing inventory write for {}: reserved {} exceeds on-hand {}",
            level.variant_id, quantity_reserved, quantity_on_hand
        )));
    }

    let result = InventoryLevelEntity::update_many()
        .set(inventory_level::ActiveModel {
            quantity_on_hand: Set(quantity_on_hand),
            quantity_reserved: Set(quantity_reserved),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(inventory_level::Column::VariantId.eq(level.variant_id))
        .filter(inventory_level::Column::QuantityOnHand.eq(level.quantity_on_hand))
        .filter(inventory_level::Column::QuantityReserved.eq(level.quantity_reserved))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::TransientInfra(format!(
            "Inventory for {} changed concurrently",
            level.variant_id
        )));
    }
    Ok(())
}

async fn reservations_with_status(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    status: ReservationStatus,
) -> Result<Vec<inventory_reservation::Model>, ServiceError> {
    Ok(ReservationEntity::find()
        .filter(inventory_reservation::Column::OrderId.eq(order_id))
        .filter(inventory_reservation::Column::Status.eq(status))
        .order_by_asc(inventory_reservation::Column::VariantId)
        .all(txn)
        .await?)
}

/// Moves a reservation out of `from`; false when another caller got there
/// first.
async fn mark_reservation(
    txn: &DatabaseTransaction,
    reservation: &inventory_reservation::Model,
    from: ReservationStatus,
    changes: inventory_reservation::ActiveModel,
) -> Result<bool, ServiceError> {
    let result = ReservationEntity::update_many()
        .set(changes)
        .filter(inventory_reservation::Column::Id.eq(reservation.id))
        .filter(inventory_reservation::Column::Status.eq(from))
        .exec(txn)
        .await?;
    Ok(result.rows_affected == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(variant_id: Uuid, quantity: i32) -> ReservationLine {
        ReservationLine {
            variant_id,
            product_name: "Mug".into(),
            quantity,
        }
    }

    #[test]
    fn merge_lines_sums_duplicate_variants_in_id_order() {
        let a = Uuid::from_u128(2);
        let b = Uuid::from_u128(1);
        let merged = merge_lines(&[line(a, 1), line(b, 2), line(a, 3)]).unwrap();
        let order: Vec<_> = merged.keys().copied().collect();
        assert_eq!(order, vec![b, a]);
        assert_eq!(merged[&a].quantity, 4);
    }

    #[test]
    fn merge_lines_rejects_non_positive_quantity() {
        assert!(matches!(
            merge_lines(&[line(Uuid::new_v4(), 0)]),
            Err(ServiceError::ValidationError(_))
        ));
    }
}
