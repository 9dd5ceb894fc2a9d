use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseTransaction, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    db::{with_transient_retry, DbPool},
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        inventory::InventoryLedger,
        order_status::{ensure_transition, forward_path, status_label},
    },
};

const ORDER_NUMBER_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ORDER_NUMBER_ATTEMPTS: usize = 5;

/// Line of an order about to be placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl NewOrderItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Snapshot of a confirmed checkout, written as one order plus its items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: Option<Uuid>,
    pub guest_id: Option<String>,
    pub subtotal_amount: Decimal,
    pub discount_amount: Decimal,
    pub shipping_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub discount_code: Option<String>,
    pub shipping_address: Option<String>,
    pub shipping_method: Option<String>,
    pub payment_method: String,
    pub notes: Option<String>,
    pub items: Vec<NewOrderItem>,
}

impl NewOrder {
    fn validate(&self) -> Result<(), ServiceError> {
        if self.user_id.is_some() == self.guest_id.is_some() {
            return Err(ServiceError::ValidationError(
                "An order belongs to exactly one of a user or a guest".to_string(),
            ));
        }
        if self.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "An order needs at least one item".to_string(),
            ));
        }
        if self.items.iter().any(|item| item.quantity <= 0) {
            return Err(ServiceError::ValidationError(
                "Item quantities must be positive".to_string(),
            ));
        }
        let items_total: Decimal = self.items.iter().map(NewOrderItem::line_total).sum();
        if items_total != self.subtotal_amount {
            return Err(ServiceError::ValidationError(format!(
                "Item totals {} do not add up to subtotal {}",
                items_total, self.subtotal_amount
            )));
        }
        let expected_total =
            self.subtotal_amount - self.discount_amount + self.shipping_amount + self.tax_amount;
        if expected_total != self.total_amount {
            return Err(ServiceError::ValidationError(format!(
                "Total {} does not match breakdown {}",
                self.total_amount, expected_total
            )));
        }
        Ok(())
    }
}

/// Order with its items and every payment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetails {
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<order_item::Model>,
    #[schema(value_type = Vec<Object>)]
    pub payments: Vec<payment::Model>,
}

/// Shipment states pushed by the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CarrierStatus {
    ReadyToPick,
    PickedUp,
    InTransit,
    Delivered,
    Returned,
}

impl CarrierStatus {
    /// Order status the shipment state implies; `None` for returns.
    pub fn order_status(self) -> Option<OrderStatus> {
        match self {
            CarrierStatus::ReadyToPick => Some(OrderStatus::Processing),
            CarrierStatus::PickedUp | CarrierStatus::InTransit => Some(OrderStatus::Shipped),
            CarrierStatus::Delivered => Some(OrderStatus::Delivered),
            CarrierStatus::Returned => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CarrierUpdateOutcome {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    /// False when the event was a duplicate or older than the order's state
    pub changed: bool,
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    inventory: Arc<InventoryLedger>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        inventory: Arc<InventoryLedger>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            inventory,
            event_sender,
        }
    }

    /// Inserts the order and its items inside the caller's transaction.
    #[instrument(skip(self, txn, new_order), fields(items = new_order.items.len()))]
    pub async fn create_in(
        &self,
        txn: &DatabaseTransaction,
        new_order: NewOrder,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        new_order.validate()?;

        let now = Utc::now();
        let order_number = unused_order_number(txn, now).await?;
        let order = order::Model {
            id: Uuid::new_v4(),
            order_number,
            user_id: new_order.user_id,
            guest_id: new_order.guest_id,
            status: OrderStatus::Pending,
            subtotal_amount: new_order.subtotal_amount,
            discount_amount: new_order.discount_amount,
            shipping_amount: new_order.shipping_amount,
            tax_amount: new_order.tax_amount,
            total_amount: new_order.total_amount,
            currency: new_order.currency,
            discount_code: new_order.discount_code,
            shipping_address: new_order.shipping_address,
            shipping_method: new_order.shipping_method,
            payment_method: new_order.payment_method,
            tracking_number: None,
            notes: new_order.notes,
            version: 1,
            placed_at: now,
            paid_at: None,
            cancelled_at: None,
            updated_at: now,
        };

        OrderEntity::insert(order::ActiveModel::from(order.clone()))
            .exec_without_returning(txn)
            .await
            .map_err(order_number_race)?;

        let items: Vec<order_item::Model> = new_order
            .items
            .into_iter()
            .map(|item| order_item::Model {
                id: Uuid::new_v4(),
                order_id: order.id,
                total_amount: item.line_total(),
                variant_id: item.variant_id,
                product_id: item.product_id,
                sku: item.sku,
                name: item.name,
                unit_price: item.unit_price,
                quantity: item.quantity,
                created_at: now,
            })
            .collect();

        OrderItemEntity::insert_many(items.iter().cloned().map(order_item::ActiveModel::from))
            .exec_without_returning(txn)
            .await?;

        counter!("orders.created", 1);
        info!(order_id = %order.id, order_number = %order.order_number, "Order created");
        Ok((order, items))
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        load_details(db, order).await
    }

    pub async fn find_by_number(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    /// Cancels a PENDING or CONFIRMED order, releasing its stock and failing
    /// any payment still awaiting the shopper.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        self.cancel_locked(order_id, reason, false)
            .await?
            .ok_or_else(|| ServiceError::InternalError(format!("Order {} was not cancelled", order_id)))
    }

    /// Like [`cancel`](Self::cancel), but leaves the order alone and returns
    /// `None` when it holds a pending payment at the time of the lock. The
    /// expiry sweep goes through here so a payment retried after its scan
    /// survives.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_if_unpaid(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<Option<order::Model>, ServiceError> {
        self.cancel_locked(order_id, reason, true).await
    }

    async fn cancel_locked(
        &self,
        order_id: Uuid,
        reason: Option<String>,
        only_unpaid: bool,
    ) -> Result<Option<order::Model>, ServiceError> {
        let reason = &reason;
        let cancelled = with_transient_retry(self.inventory.lock_retries(), move || async move {
            let txn = self.db_pool.begin().await?;
            let current = lock_order(&txn, order_id).await?;
            ensure_transition(current.status, OrderStatus::Cancelled)?;

            if only_unpaid && count_pending_payments(&txn, order_id).await? > 0 {
                txn.rollback().await?;
                return Ok(None);
            }

            self.inventory.release_in(&txn, order_id).await?;
            fail_pending_payments(&txn, order_id).await?;

            let now = Utc::now();
            let cancelled = transition_in(
                &txn,
                &current,
                OrderStatus::Cancelled,
                order::ActiveModel {
                    cancelled_at: Set(Some(now)),
                    notes: Set(reason.clone().or_else(|| current.notes.clone())),
                    ..Default::default()
                },
            )
            .await?;
            txn.commit().await?;
            Ok(Some((cancelled, current.status)))
        })
        .await?;

        let Some((order, previous)) = cancelled else {
            debug!("Order has a live payment; left open");
            return Ok(None);
        };

        counter!("orders.cancelled", 1);
        info!(from = status_label(previous), "Order cancelled");
        self.emit(Event::OrderCancelled(order.id)).await;
        self.emit(Event::InventoryReleased(order.id)).await;
        self.emit_status_change(order.id, previous, order.status).await;
        Ok(Some(order))
    }

    /// DELIVERED to RETURNED. The goods are back on hand and free to sell.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn request_return(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = with_transient_retry(self.inventory.lock_retries(), move || async move {
            let txn = self.db_pool.begin().await?;
            let current = lock_order(&txn, order_id).await?;
            let returned = return_in(&txn, &self.inventory, &current).await?;
            txn.commit().await?;
            Ok(returned)
        })
        .await?;

        self.emit(Event::InventoryReleased(order.id)).await;
        self.emit_status_change(order.id, OrderStatus::Delivered, order.status)
            .await;
        Ok(order)
    }

    /// RETURNED or DELIVERED to REFUNDED.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn refund(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let (order, previous) = with_transient_retry(self.inventory.lock_retries(), move || async move {
            let txn = self.db_pool.begin().await?;
            let current = lock_order(&txn, order_id).await?;
            let refunded =
                transition_in(&txn, &current, OrderStatus::Refunded, Default::default()).await?;
            txn.commit().await?;
            Ok((refunded, current.status))
        })
        .await?;

        counter!("orders.refunded", 1);
        self.emit_status_change(order.id, previous, order.status).await;
        Ok(order)
    }

    /// Applies a carrier push. Statuses walk forward one step at a time; an
    /// event at or behind the order's current state changes nothing.
    #[instrument(skip(self, tracking_number), fields(order_number = %order_number, status = ?carrier_status))]
    pub async fn apply_carrier_update(
        &self,
        order_number: &str,
        carrier_status: CarrierStatus,
        tracking_number: Option<String>,
    ) -> Result<CarrierUpdateOutcome, ServiceError> {
        let order_id = self.find_by_number(order_number).await?.id;
        let tracking_number = &tracking_number;

        let (order, previous, changed) =
            with_transient_retry(self.inventory.lock_retries(), move || async move {
                let txn = self.db_pool.begin().await?;
                let current = lock_order(&txn, order_id).await?;

                let updated = match carrier_status.order_status() {
                    Some(target) => {
                        advance_in(&txn, &self.inventory, &current, target, tracking_number)
                            .await?
                    }
                    None => match current.status {
                        OrderStatus::Delivered => {
                            Some(return_in(&txn, &self.inventory, &current).await?)
                        }
                        OrderStatus::Returned | OrderStatus::Refunded => None,
                        other => {
                            return Err(ServiceError::InvalidStatus(format!(
                                "Order {} cannot be returned while {}",
                                current.order_number,
                                status_label(other)
                            )))
                        }
                    },
                };

                txn.commit().await?;
                let changed = updated.is_some();
                Ok((updated.unwrap_or_else(|| current.clone()), current.status, changed))
            })
            .await?;

        if changed {
            counter!("shipping.webhook.applied", 1);
            self.emit_status_change(order.id, previous, order.status).await;
        } else {
            counter!("shipping.webhook.ignored", 1);
            debug!("Carrier event is not ahead of the order; ignored");
        }

        Ok(CarrierUpdateOutcome {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            changed,
        })
    }

    /// Hands every order placed as `guest_id` over to `user_id`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn merge_guest_orders(&self, guest_id: &str, user_id: Uuid) -> Result<u64, ServiceError> {
        let guest_id = guest_id.trim();
        if guest_id.is_empty() {
            return Err(ServiceError::ValidationError(
                "Guest id must not be empty".to_string(),
            ));
        }

        let result = OrderEntity::update_many()
            .set(order::ActiveModel {
                user_id: Set(Some(user_id)),
                guest_id: Set(None),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::GuestId.eq(guest_id))
            .exec(&*self.db_pool)
            .await?;

        info!(merged = result.rows_affected, "Merged guest orders into user account");
        Ok(result.rows_affected)
    }

    /// PENDING orders placed before `cutoff` whose payment can no longer be
    /// completed. Cash-on-delivery orders never qualify.
    pub async fn stale_unpaid_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        let db = &*self.db_pool;
        let candidates = OrderEntity::find()
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::PlacedAt.lt(cutoff))
            .filter(order::Column::PaymentMethod.ne(crate::services::payments::COD_METHOD))
            .order_by_asc(order::Column::PlacedAt)
            .all(db)
            .await?;

        let mut stale = Vec::with_capacity(candidates.len());
        for order in candidates {
            if count_pending_payments(db, order.id).await? == 0 {
                stale.push(order);
            }
        }
        Ok(stale)
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    async fn emit_status_change(&self, order_id: Uuid, from: OrderStatus, to: OrderStatus) {
        if from != to {
            self.emit(Event::OrderStatusChanged {
                order_id,
                old_status: status_label(from).to_string(),
                new_status: status_label(to).to_string(),
            })
            .await;
        }
    }
}

/// Moves `order` to `to`, bumping its version. `patch` may carry extra
/// columns to write in the same statement. Fails with
/// `ConcurrentModification` if someone else updated the order first.
pub async fn transition_in<C>(
    conn: &C,
    order: &order::Model,
    to: OrderStatus,
    mut patch: order::ActiveModel,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    ensure_transition(order.status, to)?;

    patch.status = Set(to);
    patch.version = Set(order.version + 1);
    patch.updated_at = Set(Utc::now());

    let result = OrderEntity::update_many()
        .set(patch)
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        counter!("orders.version_conflicts", 1);
        warn!(order_id = %order.id, version = order.version, "Stale order version");
        return Err(ServiceError::ConcurrentModification(order.id));
    }

    debug!(
        order_id = %order.id,
        from = status_label(order.status),
        to = status_label(to),
        "Order status changed"
    );

    OrderEntity::find_by_id(order.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))
}

/// Reads the order row under an exclusive lock.
pub async fn lock_order(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub async fn load_details<C>(conn: &C, order: order::Model) -> Result<OrderDetails, ServiceError>
where
    C: ConnectionTrait,
{
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let payments = PaymentEntity::find()
        .filter(payment::Column::OrderId.eq(order.id))
        .order_by_asc(payment::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(OrderDetails {
        order,
        items,
        payments,
    })
}

async fn count_pending_payments<C>(conn: &C, order_id: Uuid) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(PaymentEntity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .count(conn)
        .await?)
}

/// Marks every pending payment of the order as failed.
pub async fn fail_pending_payments<C>(conn: &C, order_id: Uuid) -> Result<u64, ServiceError>
where
    C: ConnectionTrait,
{
    let result = PaymentEntity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Failed),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(payment::Column::OrderId.eq(order_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

async fn advance_in(
    txn: &DatabaseTransaction,
    inventory: &InventoryLedger,
    current: &order::Model,
    target: OrderStatus,
    tracking_number: &Option<String>,
) -> Result<Option<order::Model>, ServiceError> {
    match current.status {
        OrderStatus::Pending => {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} has not been paid",
                current.order_number
            )))
        }
        OrderStatus::Cancelled => {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} was cancelled",
                current.order_number
            )))
        }
        _ => {}
    }

    let path = forward_path(current.status, target);
    if path.is_empty() {
        return Ok(None);
    }

    let mut order = current.clone();
    for step in path {
        let mut patch = order::ActiveModel::default();
        if let Some(tracking) = tracking_number {
            patch.tracking_number = Set(Some(tracking.clone()));
        }
        if step == OrderStatus::Delivered {
            inventory.confirm_sold_in(txn, order.id).await?;
            if capture_cod_payment(txn, order.id).await? && order.paid_at.is_none() {
                patch.paid_at = Set(Some(Utc::now()));
            }
        }
        order = transition_in(txn, &order, step, patch).await?;
    }
    Ok(Some(order))
}

async fn return_in(
    txn: &DatabaseTransaction,
    inventory: &InventoryLedger,
    current: &order::Model,
) -> Result<order::Model, ServiceError> {
    ensure_transition(current.status, OrderStatus::Returned)?;
    inventory.revert_sold_in(txn, current.id).await?;
    inventory.release_in(txn, current.id).await?;
    counter!("orders.returned", 1);
    transition_in(txn, current, OrderStatus::Returned, Default::default()).await
}

/// Cash collected on delivery settles the COD payment.
async fn capture_cod_payment(txn: &DatabaseTransaction, order_id: Uuid) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let result = PaymentEntity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Captured),
            paid_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(payment::Column::OrderId.eq(order_id))
        .filter(payment::Column::Provider.eq(crate::services::payments::COD_METHOD))
        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
        .exec(txn)
        .await?;
    Ok(result.rows_affected > 0)
}

pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ORDER_NUMBER_ALPHABET[rng.gen_range(0..ORDER_NUMBER_ALPHABET.len())] as char)
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

async fn unused_order_number(
    txn: &DatabaseTransaction,
    now: DateTime<Utc>,
) -> Result<String, ServiceError> {
    for _ in 0..ORDER_NUMBER_ATTEMPTS {
        let candidate = generate_order_number(now);
        let taken = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(candidate.as_str()))
            .count(txn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
        counter!("orders.number_collisions", 1);
    }
    Err(ServiceError::InternalError(
        "Could not allocate a unique order number".to_string(),
    ))
}

/// A concurrent insert took the number after our check; the whole
/// transaction is retried with a fresh number.
fn order_number_race(err: DbErr) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::TransientInfra("Order number collision".to_string())
        }
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn item(price: Decimal, quantity: i32) -> NewOrderItem {
        NewOrderItem {
            variant_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            sku: "SKU".into(),
            name: "Item".into(),
            unit_price: price,
            quantity,
        }
    }

    fn new_order() -> NewOrder {
        NewOrder {
            user_id: Some(Uuid::new_v4()),
            guest_id: None,
            subtotal_amount: dec!(250000),
            discount_amount: dec!(25000),
            shipping_amount: dec!(30000),
            tax_amount: Decimal::ZERO,
            total_amount: dec!(255000),
            currency: "VND".into(),
            discount_code: Some("SAVE10".into()),
            shipping_address: None,
            shipping_method: Some("standard".into()),
            payment_method: "paygate".into(),
            notes: None,
            items: vec![item(dec!(100000), 2), item(dec!(50000), 1)],
        }
    }

    #[test]
    fn order_numbers_are_date_prefixed() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let number = generate_order_number(now);
        assert!(number.starts_with("ORD-20240601-"));
        assert_eq!(number.len(), "ORD-20240601-".len() + 6);
        assert!(number[13..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn consistent_breakdown_is_accepted() {
        assert!(new_order().validate().is_ok());
    }

    #[test]
    fn subtotal_must_match_items() {
        let mut order = new_order();
        order.subtotal_amount = dec!(240000);
        assert!(matches!(order.validate(), Err(ServiceError::ValidationError(_))));
    }

    #[test]
    fn owner_must_be_user_or_guest() {
        let mut order = new_order();
        order.guest_id = Some("guest-1".into());
        assert!(order.validate().is_err());
        order.user_id = None;
        assert!(order.validate().is_ok());
    }

    #[test]
    fn carrier_statuses_map_onto_the_fulfillment_chain() {
        assert_eq!(
            CarrierStatus::ReadyToPick.order_status(),
            Some(OrderStatus::Processing)
        );
        assert_eq!(CarrierStatus::InTransit.order_status(), Some(OrderStatus::Shipped));
        assert_eq!(CarrierStatus::Returned.order_status(), None);
    }
}
