#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use order_fulfillment::{
    auth::{Identity, GUEST_ID_HEADER, ROLES_HEADER, USER_ID_HEADER},
    cache::InMemoryCache,
    config::{AppConfig, DiscountKind, DiscountRule},
    db,
    entities::{
        inventory_level, order,
        payment::{self, Entity as PaymentEntity},
        product_variant::{self, Entity as ProductVariantEntity},
    },
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    integrations::{
        discounts::DiscountLine, Address, CartService, DiscountEvaluation, DiscountEvaluator,
        FlatRateShippingProvider, Integrations, ShippingItem, ShippingOption,
        ShippingRateProvider,
    },
    services::{
        commerce::{CheckoutConfirmation, CheckoutSession, ConfirmCheckoutRequest, CreateSessionRequest},
        commerce::checkout_session_service::SessionItemInput,
        orders::{CarrierStatus, CarrierUpdateOutcome, NewOrder, NewOrderItem},
        payments::{hosted, CallbackOutcome, HostedGateway},
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const CARRIER_SECRET: &str = "carrier-webhook-test-secret";

/// Configuration for one isolated in-memory database. A single connection
/// keeps every query on the same SQLite memory instance.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "redis://127.0.0.1:6379".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.db_acquire_timeout_secs = 30;
    cfg.carrier_webhook_secret = Some(CARRIER_SECRET.to_string());
    cfg.discount_rules = vec![DiscountRule {
        code: "WELCOME10".to_string(),
        kind: DiscountKind::Percent,
        value: Decimal::from(10),
        min_subtotal: Decimal::ZERO,
        description: Some("10% off your first order".to_string()),
    }];
    cfg
}

/// Harness around the full application backed by in-memory SQLite.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: HostedGateway,
    _event_task: tokio::task::JoinHandle<()>,
}

pub struct TestAppBuilder {
    config: AppConfig,
    discounts: Option<Arc<dyn DiscountEvaluator>>,
    cart: Option<Arc<dyn CartService>>,
    shipping: Option<Arc<dyn ShippingRateProvider>>,
}

impl TestAppBuilder {
    pub fn configure(mut self, apply: impl FnOnce(&mut AppConfig)) -> Self {
        apply(&mut self.config);
        self
    }

    pub fn discounts(mut self, discounts: Arc<dyn DiscountEvaluator>) -> Self {
        self.discounts = Some(discounts);
        self
    }

    pub fn cart(mut self, cart: Arc<dyn CartService>) -> Self {
        self.cart = Some(cart);
        self
    }

    pub fn shipping(mut self, shipping: Arc<dyn ShippingRateProvider>) -> Self {
        self.shipping = Some(shipping);
        self
    }

    pub async fn build(self) -> TestApp {
        let cfg = self.config;
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let mut integrations = Integrations::from_config(db.clone(), &cfg);
        if let Some(discounts) = self.discounts {
            integrations.discounts = discounts;
        }
        if let Some(cart) = self.cart {
            integrations.cart = cart;
        }
        if let Some(shipping) = self.shipping {
            integrations.shipping = shipping;
        }

        let services = AppServices::with_integrations(
            db.clone(),
            &cfg,
            Arc::new(InMemoryCache::new()),
            Some(event_sender),
            integrations,
        );

        let state = AppState {
            db,
            config: cfg.clone(),
            services,
        };

        TestApp {
            router: order_fulfillment::app(state.clone()),
            state,
            gateway: HostedGateway::from_config(&cfg),
            _event_task: event_task,
        }
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            config: test_config(),
            discounts: None,
            cart: None,
            shipping: None,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Adds an active catalog variant with `stock` units on hand.
    pub async fn seed_variant(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        ProductVariantEntity::insert(product_variant::ActiveModel {
            id: Set(id),
            product_id: Set(Uuid::new_v4()),
            sku: Set(format!("SKU-{}", &id.simple().to_string()[..8])),
            name: Set(name.to_string()),
            price: Set(price),
            weight_grams: Set(500),
            active: Set(true),
        })
        .exec_without_returning(&*self.state.db)
        .await
        .expect("seed variant");

        self.services()
            .inventory
            .set_stock(id, stock, 0)
            .await
            .expect("seed stock");
        id
    }

    pub async fn set_price(&self, variant_id: Uuid, price: Decimal) {
        ProductVariantEntity::update_many()
            .col_expr(product_variant::Column::Price, Expr::value(price))
            .filter(product_variant::Column::Id.eq(variant_id))
            .exec(&*self.state.db)
            .await
            .expect("update price");
    }

    pub async fn stock(&self, variant_id: Uuid) -> inventory_level::Model {
        self.services()
            .inventory
            .level(variant_id)
            .await
            .expect("load level")
            .expect("level exists")
    }

    pub async fn order(&self, order_id: Uuid) -> order::Model {
        self.services()
            .orders
            .get(order_id)
            .await
            .expect("load order")
            .order
    }

    /// Bare PENDING order, for exercising the ledger on its own.
    pub async fn blank_order(&self) -> Uuid {
        let price = Decimal::from(100_000);
        let txn = self.state.db.begin().await.expect("begin");
        let (order, _) = self
            .services()
            .orders
            .create_in(
                &txn,
                NewOrder {
                    user_id: Some(Uuid::new_v4()),
                    guest_id: None,
                    subtotal_amount: price,
                    discount_amount: Decimal::ZERO,
                    shipping_amount: Decimal::ZERO,
                    tax_amount: Decimal::ZERO,
                    total_amount: price,
                    currency: "VND".to_string(),
                    discount_code: None,
                    shipping_address: None,
                    shipping_method: None,
                    payment_method: hosted::PROVIDER_ID.to_string(),
                    notes: None,
                    items: vec![NewOrderItem {
                        variant_id: Uuid::new_v4(),
                        product_id: Uuid::new_v4(),
                        sku: "SKU-BLANK".to_string(),
                        name: "Blank".to_string(),
                        unit_price: price,
                        quantity: 1,
                    }],
                },
            )
            .await
            .expect("create order");
        txn.commit().await.expect("commit");
        order.id
    }

    pub async fn payments_of(&self, order_id: Uuid) -> Vec<payment::Model> {
        PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(&*self.state.db)
            .await
            .expect("load payments")
    }

    /// Session with a delivery address and the given payment method picked.
    pub async fn open_session(
        &self,
        identity: &Identity,
        items: &[(Uuid, i32)],
        payment_method: &str,
    ) -> CheckoutSession {
        let sessions = &self.services().sessions;
        let session = sessions
            .create(identity, session_request(items))
            .await
            .expect("create session");
        sessions
            .update_payment_method(&session.id, identity, payment_method)
            .await
            .expect("select payment method")
    }

    pub async fn confirm(
        &self,
        identity: &Identity,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<CheckoutConfirmation, ServiceError> {
        self.services()
            .checkout
            .confirm_checkout(
                session_id,
                identity,
                idempotency_key,
                ConfirmCheckoutRequest::default(),
            )
            .await
    }

    /// Opens a session and places the order in one go.
    pub async fn place_order(
        &self,
        identity: &Identity,
        items: &[(Uuid, i32)],
        payment_method: &str,
    ) -> CheckoutConfirmation {
        let session = self.open_session(identity, items, payment_method).await;
        self.confirm(identity, &session.id, &Uuid::new_v4().to_string())
            .await
            .expect("confirm checkout")
    }

    /// Feeds a correctly signed gateway callback through the payment service.
    pub async fn gateway_callback(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        response_code: &str,
    ) -> CallbackOutcome {
        let params = hosted::signed_callback(&self.gateway, payment_id, amount, response_code)
            .expect("sign callback");
        self.services()
            .payments
            .handle_callback(hosted::PROVIDER_ID, &params)
            .await
            .expect("handle callback")
    }

    pub async fn pay(&self, confirmation: &CheckoutConfirmation) -> CallbackOutcome {
        self.gateway_callback(confirmation.payment_id, confirmation.total_amount, "00")
            .await
    }

    pub async fn carrier(
        &self,
        order_number: &str,
        status: CarrierStatus,
    ) -> Result<CarrierUpdateOutcome, ServiceError> {
        self.services()
            .orders
            .apply_carrier_update(order_number, status, Some("TRACK-1".to_string()))
            .await
    }

    /// Sends a request through the router and decodes the JSON body, if any.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, body)
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        identity: Option<&Identity>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request_with_headers(method, uri, identity, body, &[])
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        identity: Option<&Identity>,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(identity) = identity {
            for (name, value) in identity_headers(identity) {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let (status, _, body) = self.send(request).await;
        (status, body)
    }
}

pub fn identity_headers(identity: &Identity) -> Vec<(&'static str, String)> {
    let mut headers = Vec::new();
    if let Some(user_id) = identity.user_id {
        headers.push((USER_ID_HEADER, user_id.to_string()));
    }
    if let Some(guest_id) = &identity.guest_id {
        headers.push((GUEST_ID_HEADER, guest_id.clone()));
    }
    if identity.is_admin {
        headers.push((ROLES_HEADER, "admin".to_string()));
    }
    headers
}

pub fn shopper() -> Identity {
    Identity::user(Uuid::new_v4())
}

pub fn address() -> Address {
    Address {
        recipient_name: "Nguyen Van A".to_string(),
        phone: "0901234567".to_string(),
        line1: "12 Ly Thuong Kiet".to_string(),
        line2: None,
        city: "Ha Noi".to_string(),
        province: None,
        postal_code: Some("100000".to_string()),
        country: "VN".to_string(),
    }
}

pub fn session_request(items: &[(Uuid, i32)]) -> CreateSessionRequest {
    CreateSessionRequest {
        items: items
            .iter()
            .map(|(variant_id, quantity)| SessionItemInput {
                variant_id: *variant_id,
                quantity: *quantity,
            })
            .collect(),
        cart_id: None,
        discount_code: None,
        shipping_address: Some(address()),
        notes: None,
    }
}

/// Discount service that is down.
pub struct UnreachableDiscounts;

#[async_trait]
impl DiscountEvaluator for UnreachableDiscounts {
    async fn evaluate(
        &self,
        _code: &str,
        _subtotal: Decimal,
        _items: &[DiscountLine],
        _user_id: Option<Uuid>,
    ) -> Result<DiscountEvaluation, ServiceError> {
        Err(ServiceError::TransientInfra("discount service unreachable".to_string()))
    }
}

/// Cart service that remembers what it cleared, or always fails.
#[derive(Default)]
pub struct RecordingCart {
    pub cleared: Mutex<Vec<Uuid>>,
    pub fail: bool,
}

impl RecordingCart {
    pub fn failing() -> Self {
        Self {
            cleared: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn cleared(&self) -> Vec<Uuid> {
        self.cleared.lock().expect("cart lock").clone()
    }
}

#[async_trait]
impl CartService for RecordingCart {
    async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        if self.fail {
            return Err(ServiceError::TransientInfra("cart service unreachable".to_string()));
        }
        self.cleared.lock().expect("cart lock").push(cart_id);
        Ok(())
    }
}

/// Flat-rate shipping that can be switched off to simulate an outage.
#[derive(Default)]
pub struct SwitchableShipping {
    pub down: AtomicBool,
    rates: FlatRateShippingProvider,
}

impl SwitchableShipping {
    pub fn unreachable() -> Self {
        Self {
            down: AtomicBool::new(true),
            rates: FlatRateShippingProvider::default(),
        }
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShippingRateProvider for SwitchableShipping {
    async fn quote(
        &self,
        address: &Address,
        items: &[ShippingItem],
    ) -> Result<Vec<ShippingOption>, ServiceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ServiceError::TransientInfra("carrier rates unreachable".to_string()));
        }
        self.rates.quote(address, items).await
    }
}
