//! Payment providers and callback reconciliation.
//!
//! `PaymentService` is the registry the checkout talks to: it lists the
//! methods a basket qualifies for, opens payment records, builds the URL the
//! shopper is sent to and applies provider callbacks. Each provider only
//! knows its own wire format.

pub mod cod;
pub mod hosted;

pub use cod::CashOnDelivery;
pub use hosted::HostedGateway;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    db::with_transient_retry,
    entities::{
        order::{self, OrderStatus},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::{fail_pending_payments, lock_order, transition_in},
};

/// Method and provider id of cash on delivery.
pub const COD_METHOD: &str = "cod";

/// Raw callback parameters as the provider sent them.
pub type CallbackParams = BTreeMap<String, String>;

/// A payment method offered at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentMethod {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// True when the shopper is sent to a hosted payment page
    pub redirect: bool,
}

/// Provider-neutral view of a callback after its signature was checked.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCallback {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub success: bool,
    pub provider_txn_ref: Option<String>,
}

/// Result of applying a provider callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// Payment captured and the order confirmed
    Processed,
    /// Provider reported a failed or abandoned payment
    Declined,
    /// Already applied earlier; nothing changed
    Duplicate,
    NotFound,
    AmountMismatch,
    InvalidSignature,
    /// Money arrived for an order that can no longer be paid
    Unpayable,
}

impl CallbackOutcome {
    /// Two-character acknowledgement returned to the provider.
    pub fn ack_code(self) -> &'static str {
        match self {
            CallbackOutcome::Processed | CallbackOutcome::Declined => "00",
            CallbackOutcome::NotFound => "01",
            CallbackOutcome::Duplicate => "02",
            CallbackOutcome::AmountMismatch => "04",
            CallbackOutcome::InvalidSignature => "97",
            CallbackOutcome::Unpayable => "99",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CallbackOutcome::Processed => "Confirm success",
            CallbackOutcome::Declined => "Payment failure recorded",
            CallbackOutcome::Duplicate => "Order already confirmed",
            CallbackOutcome::NotFound => "Order not found",
            CallbackOutcome::AmountMismatch => "Invalid amount",
            CallbackOutcome::InvalidSignature => "Invalid signature",
            CallbackOutcome::Unpayable => "Order is not payable",
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            CallbackOutcome::Processed => "processed",
            CallbackOutcome::Declined => "declined",
            CallbackOutcome::Duplicate => "duplicate",
            CallbackOutcome::NotFound => "not_found",
            CallbackOutcome::AmountMismatch => "amount_mismatch",
            CallbackOutcome::InvalidSignature => "invalid_signature",
            CallbackOutcome::Unpayable => "unpayable",
        }
    }
}

/// One payment provider.
pub trait PaymentProvider: Send + Sync {
    fn id(&self) -> &'static str;

    fn methods(&self) -> Vec<PaymentMethod>;

    /// Whether an order of `total` may be paid with this provider.
    fn is_available(&self, total: Decimal) -> bool;

    /// How long a new payment stays payable; `None` never lapses.
    fn payment_expiry(&self) -> Option<Duration>;

    fn payment_url(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        method_id: &str,
    ) -> Result<String, ServiceError>;

    /// Signature check over the raw parameters.
    fn verify_callback(&self, params: &CallbackParams) -> bool;

    fn parse_callback(&self, params: &CallbackParams) -> Result<ParsedCallback, ServiceError>;
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    providers: Vec<Arc<dyn PaymentProvider>>,
    lock_retries: u32,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        providers: Vec<Arc<dyn PaymentProvider>>,
        lock_retries: u32,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            providers,
            lock_retries,
            event_sender,
        }
    }

    /// Registry with the hosted gateway and cash on delivery.
    pub fn from_config(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let providers: Vec<Arc<dyn PaymentProvider>> = vec![
            Arc::new(HostedGateway::from_config(config)),
            Arc::new(CashOnDelivery::new(
                config.cod_max_amount,
                config.order_confirmation_base_url.clone(),
            )),
        ];
        Self::new(db, providers, config.inventory_lock_retries, event_sender)
    }

    pub fn list_available_methods(&self, total: Decimal) -> Vec<PaymentMethod> {
        self.providers
            .iter()
            .filter(|provider| provider.is_available(total))
            .flat_map(|provider| provider.methods())
            .collect()
    }

    pub fn provider(&self, provider_id: &str) -> Option<&Arc<dyn PaymentProvider>> {
        self.providers
            .iter()
            .find(|provider| provider.id().eq_ignore_ascii_case(provider_id))
    }

    fn provider_for_method(&self, method_id: &str) -> Result<&Arc<dyn PaymentProvider>, ServiceError> {
        self.providers
            .iter()
            .find(|provider| provider.methods().iter().any(|m| m.id == method_id))
            .ok_or_else(|| {
                ServiceError::ValidationError(format!("Unknown payment method {}", method_id))
            })
    }

    /// Opens a PENDING payment for `order` inside the caller's transaction.
    /// Any payment still pending for the order is superseded.
    #[instrument(skip(self, txn, order), fields(order_id = %order.id, method = %method_id))]
    pub async fn create_payment_in(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        method_id: &str,
    ) -> Result<payment::Model, ServiceError> {
        let provider = self.provider_for_method(method_id)?;
        if !provider.is_available(order.total_amount) {
            return Err(ServiceError::ValidationError(format!(
                "Payment method {} is not available for this order",
                method_id
            )));
        }

        let superseded = fail_pending_payments(txn, order.id).await?;
        if superseded > 0 {
            info!(superseded, "Superseded earlier pending payment");
        }

        let now = Utc::now();
        let expires_at = provider
            .payment_expiry()
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .map(|window| now + window);

        let payment = payment::Model {
            id: Uuid::new_v4(),
            order_id: order.id,
            provider: provider.id().to_string(),
            method: method_id.to_string(),
            status: PaymentStatus::Pending,
            amount: order.total_amount,
            provider_txn_ref: None,
            expires_at,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        PaymentEntity::insert(payment::ActiveModel {
            id: Set(payment.id),
            order_id: Set(payment.order_id),
            provider: Set(payment.provider.clone()),
            method: Set(payment.method.clone()),
            status: Set(payment.status),
            amount: Set(payment.amount),
            provider_txn_ref: Set(None),
            expires_at: Set(payment.expires_at),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .exec_without_returning(txn)
        .await?;

        counter!("payments.created", 1);
        Ok(payment)
    }

    pub fn payment_url(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        method_id: &str,
    ) -> Result<String, ServiceError> {
        self.provider_for_method(method_id)?
            .payment_url(order, payment, method_id)
    }

    pub fn verify_callback(&self, provider_id: &str, params: &CallbackParams) -> bool {
        self.provider(provider_id)
            .map(|provider| provider.verify_callback(params))
            .unwrap_or(false)
    }

    /// Applies a provider callback. Safe to call repeatedly with the same
    /// parameters: anything already applied comes back as `Duplicate`.
    #[instrument(skip(self, params), fields(provider = %provider_id))]
    pub async fn handle_callback(
        &self,
        provider_id: &str,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, ServiceError> {
        let provider = self.provider(provider_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Unknown payment provider {}", provider_id))
        })?;

        if !provider.verify_callback(params) {
            counter!("payments.webhook.invalid_signature", 1);
            warn!("Rejected payment callback with an invalid signature");
            return Ok(CallbackOutcome::InvalidSignature);
        }

        let callback = match provider.parse_callback(params) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(error = %e, "Payment callback does not reference a known payment");
                return Ok(CallbackOutcome::NotFound);
            }
        };

        let callback = &callback;
        let (outcome, order_id) = with_transient_retry(self.lock_retries, move || async move {
            let txn = self.db.begin().await?;
            let result = apply_callback(&txn, callback).await?;
            txn.commit().await?;
            Ok(result)
        })
        .await?;

        counter!("payments.webhook", 1, "outcome" => outcome.metric_label());
        info!(outcome = outcome.metric_label(), payment_id = %callback.payment_id, "Payment callback handled");

        if let Some(order_id) = order_id {
            match outcome {
                CallbackOutcome::Processed => {
                    self.emit(Event::PaymentCaptured {
                        order_id,
                        payment_id: callback.payment_id,
                    })
                    .await;
                    self.emit(Event::OrderStatusChanged {
                        order_id,
                        old_status: "PENDING".to_string(),
                        new_status: "CONFIRMED".to_string(),
                    })
                    .await;
                }
                CallbackOutcome::Declined => {
                    self.emit(Event::PaymentFailed {
                        order_id,
                        payment_id: callback.payment_id,
                    })
                    .await;
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Fails pending payments whose window has passed.
    pub async fn expire_overdue(&self) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let result = PaymentEntity::update_many()
            .set(payment::ActiveModel {
                status: Set(PaymentStatus::Failed),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .filter(payment::Column::ExpiresAt.is_not_null())
            .filter(payment::Column::ExpiresAt.lte(now))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            counter!("payments.expired", result.rows_affected);
        }
        Ok(result.rows_affected)
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}

async fn apply_callback(
    txn: &DatabaseTransaction,
    callback: &ParsedCallback,
) -> Result<(CallbackOutcome, Option<Uuid>), ServiceError> {
    let Some(payment) = PaymentEntity::find_by_id(callback.payment_id)
        .lock_exclusive()
        .one(txn)
        .await?
    else {
        return Ok((CallbackOutcome::NotFound, None));
    };
    let order = lock_order(txn, payment.order_id).await?;
    let found = Some(order.id);

    if payment.status == PaymentStatus::Captured || order.paid_at.is_some() {
        return Ok((CallbackOutcome::Duplicate, found));
    }
    if callback.amount != payment.amount {
        warn!(
            expected = %payment.amount,
            received = %callback.amount,
            "Payment callback amount does not match"
        );
        return Ok((CallbackOutcome::AmountMismatch, found));
    }

    let now = Utc::now();
    if !callback.success {
        if payment.status != PaymentStatus::Pending {
            return Ok((CallbackOutcome::Duplicate, found));
        }
        PaymentEntity::update_many()
            .set(payment::ActiveModel {
                status: Set(PaymentStatus::Failed),
                provider_txn_ref: Set(callback.provider_txn_ref.clone()),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(txn)
            .await?;
        return Ok((CallbackOutcome::Declined, found));
    }

    if order.status != OrderStatus::Pending {
        error!(
            order_id = %order.id,
            payment_id = %payment.id,
            "Funds captured for an order that is no longer awaiting payment"
        );
        return Ok((CallbackOutcome::Unpayable, found));
    }

    // A late success for a superseded attempt still pays the order; other
    // attempts stop being payable.
    fail_pending_payments(txn, order.id).await?;
    PaymentEntity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Captured),
            provider_txn_ref: Set(callback.provider_txn_ref.clone()),
            paid_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment.id))
        .exec(txn)
        .await?;

    transition_in(
        txn,
        &order,
        OrderStatus::Confirmed,
        order::ActiveModel {
            paid_at: Set(Some(now)),
            ..Default::default()
        },
    )
    .await?;

    Ok((CallbackOutcome::Processed, found))
}
