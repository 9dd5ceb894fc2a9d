use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue::Set, DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::{
        order::{self, OrderStatus},
        payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    integrations::{with_timeout, CartService, CatalogLookup, NotificationSender, OrderConfirmation},
    services::{
        commerce::checkout_session_service::{CheckoutSession, CheckoutSessionService},
        idempotency::{request_hash, IdempotencyGuard},
        inventory::{InventoryLedger, ReservationLine},
        orders::{lock_order, transition_in, NewOrder, NewOrderItem, OrderService},
        payments::{PaymentService, COD_METHOD},
    },
};

const CONFIRM_SCOPE: &str = "checkout.confirm";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct ConfirmCheckoutRequest {
    /// Note for the warehouse, overrides the one stored on the session
    #[serde(default)]
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

/// What the shopper needs after placing an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CheckoutConfirmation {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_id: Uuid,
    pub payment_method: String,
    /// Hosted payment page, or the order page for cash on delivery
    pub payment_url: String,
    pub payment_expires_at: Option<DateTime<Utc>>,
}

impl CheckoutConfirmation {
    fn new(order: &order::Model, payment: &payment::Model, payment_url: String) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            payment_id: payment.id,
            payment_method: payment.method.clone(),
            payment_url,
            payment_expires_at: payment.expires_at,
        }
    }
}

/// Turns a checkout session into an order.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    sessions: Arc<CheckoutSessionService>,
    catalog: Arc<dyn CatalogLookup>,
    inventory: Arc<InventoryLedger>,
    orders: Arc<OrderService>,
    payments: Arc<PaymentService>,
    idempotency: Arc<IdempotencyGuard>,
    cart: Arc<dyn CartService>,
    notifications: Arc<dyn NotificationSender>,
    event_sender: Option<Arc<EventSender>>,
    call_timeout: Duration,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        sessions: Arc<CheckoutSessionService>,
        catalog: Arc<dyn CatalogLookup>,
        inventory: Arc<InventoryLedger>,
        orders: Arc<OrderService>,
        payments: Arc<PaymentService>,
        idempotency: Arc<IdempotencyGuard>,
        cart: Arc<dyn CartService>,
        notifications: Arc<dyn NotificationSender>,
        event_sender: Option<Arc<EventSender>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            sessions,
            catalog,
            inventory,
            orders,
            payments,
            idempotency,
            cart,
            notifications,
            event_sender,
            call_timeout,
        }
    }

    /// Places the order for a session, at most once per idempotency key.
    #[instrument(skip(self, identity, idempotency_key, request), fields(session_id = %session_id))]
    pub async fn confirm_checkout(
        &self,
        session_id: &str,
        identity: &Identity,
        idempotency_key: &str,
        request: ConfirmCheckoutRequest,
    ) -> Result<CheckoutConfirmation, ServiceError> {
        request.validate()?;
        let hash = request_hash(&(session_id, &request))?;

        self.idempotency
            .execute(CONFIRM_SCOPE, idempotency_key, &hash, || {
                self.place_order(session_id, identity, request)
            })
            .await
    }

    async fn place_order(
        &self,
        session_id: &str,
        identity: &Identity,
        request: ConfirmCheckoutRequest,
    ) -> Result<CheckoutConfirmation, ServiceError> {
        let session = self.sessions.get(session_id, identity).await?;
        if !session.can_confirm {
            return Err(ServiceError::ValidationError(format!(
                "Checkout session cannot be confirmed yet: {}",
                session.errors.join("; ")
            )));
        }
        let method_id = session.selected_payment_method.clone().ok_or_else(|| {
            ServiceError::ValidationError("Select a payment method".to_string())
        })?;

        self.revalidate(&session).await?;

        let new_order = self.order_snapshot(&session, request.notes)?;
        let lines: Vec<ReservationLine> = session
            .items
            .iter()
            .map(|line| ReservationLine {
                variant_id: line.variant_id,
                product_name: line.name.clone(),
                quantity: line.quantity,
            })
            .collect();

        let (new_order, lines, method_id) = (&new_order, &lines, method_id.as_str());
        let (confirmation, order) =
            crate::db::with_transient_retry(self.inventory.lock_retries(), move || async move {
                let txn = self.db.begin().await?;
                match self.write_order(&txn, new_order, lines, method_id).await {
                    Ok(placed) => {
                        txn.commit().await?;
                        Ok(placed)
                    }
                    Err(err) => {
                        txn.rollback().await?;
                        Err(err)
                    }
                }
            })
            .await?;

        counter!("checkout.confirmed", 1);
        info!(
            order_id = %confirmation.order_id,
            order_number = %confirmation.order_number,
            total = %confirmation.total_amount,
            "Checkout confirmed"
        );

        self.finish(&session, &order, &confirmation).await;
        Ok(confirmation)
    }

    /// Live prices must still match the quote and stock must still cover
    /// every line. Stock is checked again under lock by the reservation.
    async fn revalidate(&self, session: &CheckoutSession) -> Result<(), ServiceError> {
        let variant_ids: Vec<Uuid> = session.items.iter().map(|l| l.variant_id).collect();
        let live = with_timeout(
            self.call_timeout,
            "catalog",
            self.catalog.get_variants(&variant_ids),
        )
        .await?;
        let stock = self.inventory.available_stock_many(&variant_ids).await?;

        for line in &session.items {
            let variant = live.get(&line.variant_id).ok_or_else(|| {
                ServiceError::NotFound(format!("{} is no longer available", line.name))
            })?;
            if variant.live_price != line.unit_price {
                counter!("checkout.price_changed", 1);
                return Err(ServiceError::PriceChanged {
                    product_name: line.name.clone(),
                    quoted: line.unit_price,
                    current: variant.live_price,
                });
            }

            let available = stock.get(&line.variant_id).copied().unwrap_or(0);
            if available < line.quantity {
                counter!("inventory.stock_conflicts", 1);
                return Err(ServiceError::InsufficientStock {
                    product_name: line.name.clone(),
                    available,
                    requested: line.quantity,
                });
            }
        }
        Ok(())
    }

    fn order_snapshot(
        &self,
        session: &CheckoutSession,
        notes: Option<String>,
    ) -> Result<NewOrder, ServiceError> {
        let shipping_address = session
            .shipping_address
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(NewOrder {
            user_id: session.user_id,
            guest_id: session.guest_id.clone(),
            subtotal_amount: session.subtotal_amount,
            discount_amount: session.discount_amount,
            shipping_amount: session.shipping_amount,
            tax_amount: session.tax_amount,
            total_amount: session.total_amount,
            currency: session.currency.clone(),
            discount_code: session
                .discount_code
                .clone()
                .filter(|_| session.discount_amount > Decimal::ZERO),
            shipping_address,
            shipping_method: session.selected_shipping.clone(),
            payment_method: session.selected_payment_method.clone().unwrap_or_default(),
            notes: notes.or_else(|| session.notes.clone()),
            items: session
                .items
                .iter()
                .map(|line| NewOrderItem {
                    variant_id: line.variant_id,
                    product_id: line.product_id,
                    sku: line.sku.clone(),
                    name: line.name.clone(),
                    unit_price: line.unit_price,
                    quantity: line.quantity,
                })
                .collect(),
        })
    }

    /// Order, items, reservation and payment, all inside `txn`.
    async fn write_order(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        new_order: &NewOrder,
        lines: &[ReservationLine],
        method_id: &str,
    ) -> Result<(CheckoutConfirmation, order::Model), ServiceError> {
        let (mut order, _items) = self.orders.create_in(txn, new_order.clone()).await?;
        self.inventory.reserve_in(txn, order.id, lines).await?;
        let payment = self.payments.create_payment_in(txn, &order, method_id).await?;

        if method_id == COD_METHOD {
            // Nothing to wait for: the order goes to the warehouse and the
            // cash is collected on delivery.
            order = transition_in(txn, &order, OrderStatus::Confirmed, Default::default()).await?;
        }

        let payment_url = self.payments.payment_url(&order, &payment, method_id)?;
        Ok((CheckoutConfirmation::new(&order, &payment, payment_url), order))
    }

    /// Post-commit work. Failures are logged and never undo the order.
    async fn finish(
        &self,
        session: &CheckoutSession,
        order: &order::Model,
        confirmation: &CheckoutConfirmation,
    ) {
        if let Some(cart_id) = session.cart_id {
            if let Err(e) =
                with_timeout(self.call_timeout, "cart", self.cart.clear_cart(cart_id)).await
            {
                warn!(error = %e, %cart_id, "Failed to clear cart after checkout");
            }
        }
        if let Err(e) = self.sessions.delete(&session.id).await {
            warn!(error = %e, session_id = %session.id, "Failed to delete checkout session");
        }

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::OrderCreated {
                    order_id: order.id,
                    order_number: order.order_number.clone(),
                    total_amount: order.total_amount,
                })
                .await;
            sender
                .send_or_log(Event::InventoryReserved {
                    order_id: order.id,
                    variant_ids: session.items.iter().map(|l| l.variant_id).collect(),
                })
                .await;
            sender
                .send_or_log(Event::PaymentCreated {
                    order_id: order.id,
                    payment_id: confirmation.payment_id,
                    provider: confirmation.payment_method.clone(),
                })
                .await;
            sender
                .send_or_log(Event::CheckoutSessionCompleted(session.id.clone()))
                .await;
        }

        let notifications = self.notifications.clone();
        let timeout = self.call_timeout;
        let message = OrderConfirmation {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            guest_id: order.guest_id.clone(),
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            payment_url: confirmation.payment_url.clone(),
        };
        tokio::spawn(async move {
            let sent = with_timeout(
                timeout,
                "notifications",
                notifications.send_order_confirmation(&message),
            )
            .await;
            if let Err(e) = sent {
                warn!(error = %e, order_id = %message.order_id, "Order confirmation not sent");
            }
        });
    }

    /// Opens a fresh payment for an order still awaiting payment. The
    /// previous attempt is superseded.
    #[instrument(skip(self, identity), fields(order_id = %order_id))]
    pub async fn retry_payment(
        &self,
        order_id: Uuid,
        identity: &Identity,
        method_id: &str,
    ) -> Result<CheckoutConfirmation, ServiceError> {
        if method_id == COD_METHOD {
            return Err(ServiceError::ValidationError(
                "Cash on delivery can only be chosen at checkout".to_string(),
            ));
        }

        let confirmation = crate::db::with_transient_retry(
            self.inventory.lock_retries(),
            move || async move {
                let txn = self.db.begin().await?;
                let mut order = lock_order(&txn, order_id).await?;
                if !identity.can_access(order.user_id, order.guest_id.as_deref()) {
                    return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
                }
                if order.status != OrderStatus::Pending {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Order {} is not awaiting payment",
                        order.order_number
                    )));
                }

                let payment = self.payments.create_payment_in(&txn, &order, method_id).await?;
                if order.payment_method != method_id {
                    order = self.switch_payment_method(&txn, &order, method_id).await?;
                }
                let url = self.payments.payment_url(&order, &payment, method_id)?;
                txn.commit().await?;
                Ok(CheckoutConfirmation::new(&order, &payment, url))
            },
        )
        .await?;

        counter!("payments.retried", 1);
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::PaymentCreated {
                    order_id,
                    payment_id: confirmation.payment_id,
                    provider: confirmation.payment_method.clone(),
                })
                .await;
        }
        Ok(confirmation)
    }

    async fn switch_payment_method(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        order: &order::Model,
        method_id: &str,
    ) -> Result<order::Model, ServiceError> {
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

        let result = order::Entity::update_many()
            .set(order::ActiveModel {
                payment_method: Set(method_id.to_string()),
                version: Set(order.version + 1),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        Ok(order::Model {
            payment_method: method_id.to_string(),
            version: order.version + 1,
            ..order.clone()
        })
    }
}
