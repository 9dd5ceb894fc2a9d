pub mod checkout;
pub mod orders;
pub mod payment_webhooks;
pub mod shipping_webhooks;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::cache::CacheBackend;
use crate::config::AppConfig;
use crate::events::EventSender;
use crate::integrations::Integrations;
use crate::services::{
    commerce::{CheckoutService, CheckoutSessionService, PricingService},
    idempotency::IdempotencyGuard,
    inventory::InventoryLedger,
    orders::OrderService,
    payment_expiry::PaymentExpirySweeper,
    payments::PaymentService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub inventory: Arc<InventoryLedger>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub pricing: Arc<PricingService>,
    pub sessions: Arc<CheckoutSessionService>,
    pub checkout: Arc<CheckoutService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        cache: Arc<dyn CacheBackend>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let integrations = Integrations::from_config(db.clone(), config);
        Self::with_integrations(db, config, cache, event_sender, integrations)
    }

    /// Same as [`AppServices::new`] with caller-supplied collaborators.
    pub fn with_integrations(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        cache: Arc<dyn CacheBackend>,
        event_sender: Option<Arc<EventSender>>,
        integrations: Integrations,
    ) -> Self {
        let call_timeout = config.external_call_timeout();

        let inventory = Arc::new(InventoryLedger::new(db.clone(), config.inventory_lock_retries));
        let idempotency = Arc::new(IdempotencyGuard::new(
            db.clone(),
            config.idempotency_ttl(),
            config.idempotency_processing_timeout(),
        ));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            inventory.clone(),
            event_sender.clone(),
        ));
        let payments = Arc::new(PaymentService::from_config(
            db.clone(),
            config,
            event_sender.clone(),
        ));
        let pricing = Arc::new(PricingService::new(integrations.discounts.clone(), call_timeout));
        let sessions = Arc::new(CheckoutSessionService::new(
            cache,
            integrations.catalog.clone(),
            inventory.clone(),
            pricing.clone(),
            integrations.shipping.clone(),
            payments.clone(),
            config.checkout_session_ttl(),
            call_timeout,
            config.currency.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db,
            sessions.clone(),
            integrations.catalog,
            inventory.clone(),
            orders.clone(),
            payments.clone(),
            idempotency.clone(),
            integrations.cart,
            integrations.notifications,
            event_sender,
            call_timeout,
        ));

        Self {
            inventory,
            idempotency,
            orders,
            payments,
            pricing,
            sessions,
            checkout,
        }
    }

    pub fn payment_sweeper(&self, config: &AppConfig) -> PaymentExpirySweeper {
        PaymentExpirySweeper::new(
            self.payments.clone(),
            self.orders.clone(),
            self.idempotency.clone(),
            config.payment_expiry(),
        )
    }
}
