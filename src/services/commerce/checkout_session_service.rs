//! Checkout sessions: the short-lived staging record between a cart and an
//! order.
//!
//! A session lives in the cache under `checkout:session:{id}` with a TTL
//! fixed at creation. Every update is read, recomputed and written back as
//! one value. Sessions never move money; orders, payments and inventory are
//! the source of truth.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    cache::CacheBackend,
    errors::ServiceError,
    integrations::{
        with_timeout, Address, CatalogLookup, ShippingItem, ShippingOption, ShippingRateProvider,
    },
    services::{
        commerce::pricing_service::{PricingLine, PricingService},
        inventory::InventoryLedger,
        payments::{PaymentMethod, PaymentService},
    },
};

const SESSION_KEY_PREFIX: &str = "checkout:session:";
const MAX_LINE_QUANTITY: i32 = 999;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct SessionItemInput {
    pub variant_id: Uuid,
    #[validate(range(min = 1, max = 999))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<SessionItemInput>,
    /// Cart the items came from; emptied once the order is placed
    #[serde(default)]
    pub cart_id: Option<Uuid>,
    #[serde(default)]
    pub discount_code: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<Address>,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    Insufficient,
    OutOfStock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    /// Price captured when the item entered the session
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    pub weight_grams: i32,
    pub available_stock: i32,
    pub stock_status: StockStatus,
}

impl SessionLine {
    fn pricing_line(&self) -> PricingLine {
        PricingLine {
            variant_id: self.variant_id,
            product_id: self.product_id,
            unit_price: self.unit_price,
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSession {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub guest_id: Option<String>,
    pub cart_id: Option<Uuid>,
    pub items: Vec<SessionLine>,
    pub currency: String,
    pub subtotal_amount: Decimal,
    pub discount_amount: Decimal,
    pub shipping_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub discount_code: Option<String>,
    pub discount_detail: Option<String>,
    pub shipping_address: Option<Address>,
    pub shipping_options: Vec<ShippingOption>,
    pub selected_shipping: Option<String>,
    pub payment_methods: Vec<PaymentMethod>,
    pub selected_payment_method: Option<String>,
    pub notes: Option<String>,
    pub can_confirm: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn selected_shipping_option(&self) -> Option<&ShippingOption> {
        let selected = self.selected_shipping.as_deref()?;
        self.shipping_options.iter().find(|o| o.id == selected)
    }
}

pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

/// Collaborators a session needs to recompute itself.
#[derive(Clone)]
pub struct CheckoutSessionService {
    cache: Arc<dyn CacheBackend>,
    catalog: Arc<dyn CatalogLookup>,
    inventory: Arc<InventoryLedger>,
    pricing: Arc<PricingService>,
    shipping: Arc<dyn ShippingRateProvider>,
    payments: Arc<PaymentService>,
    ttl: Duration,
    call_timeout: Duration,
    currency: String,
}

impl CheckoutSessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        catalog: Arc<dyn CatalogLookup>,
        inventory: Arc<InventoryLedger>,
        pricing: Arc<PricingService>,
        shipping: Arc<dyn ShippingRateProvider>,
        payments: Arc<PaymentService>,
        ttl: Duration,
        call_timeout: Duration,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            catalog,
            inventory,
            pricing,
            shipping,
            payments,
            ttl,
            call_timeout,
            currency: currency.into(),
        }
    }

    #[instrument(skip(self, identity, request), fields(items = request.items.len()))]
    pub async fn create(
        &self,
        identity: &Identity,
        request: CreateSessionRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate()?;
        }
        if let Some(address) = &request.shipping_address {
            address.validate()?;
        }

        let mut quantities: BTreeMap<Uuid, i32> = BTreeMap::new();
        for item in &request.items {
            *quantities.entry(item.variant_id).or_default() += item.quantity;
        }
        if quantities.values().any(|q| *q > MAX_LINE_QUANTITY) {
            return Err(ServiceError::ValidationError(format!(
                "At most {} units of one item per order",
                MAX_LINE_QUANTITY
            )));
        }

        let variant_ids: Vec<Uuid> = quantities.keys().copied().collect();
        let variants = with_timeout(
            self.call_timeout,
            "catalog",
            self.catalog.get_variants(&variant_ids),
        )
        .await?;

        // Lines keep the order the shopper listed them in.
        let mut items = Vec::with_capacity(quantities.len());
        for item in &request.items {
            let Some(quantity) = quantities.remove(&item.variant_id) else {
                continue;
            };
            let variant = variants.get(&item.variant_id).ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Product variant {} is not available",
                    item.variant_id
                ))
            })?;
            items.push(SessionLine {
                variant_id: variant.variant_id,
                product_id: variant.product_id,
                sku: variant.sku.clone(),
                name: variant.name.clone(),
                unit_price: variant.live_price,
                quantity,
                line_total: variant.live_price * Decimal::from(quantity),
                weight_grams: variant.weight_grams,
                available_stock: 0,
                stock_status: StockStatus::OutOfStock,
            });
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ServiceError::InternalError(format!("Invalid session TTL: {}", e)))?;
        let mut session = CheckoutSession {
            id: format!("cs_{}", Uuid::new_v4().simple()),
            user_id: identity.user_id,
            guest_id: if identity.user_id.is_some() {
                None
            } else {
                identity.guest_id.clone()
            },
            cart_id: request.cart_id,
            items,
            currency: self.currency.clone(),
            subtotal_amount: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            shipping_amount: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            discount_code: normalize_code(request.discount_code),
            discount_detail: None,
            shipping_address: request.shipping_address,
            shipping_options: Vec::new(),
            selected_shipping: None,
            payment_methods: Vec::new(),
            selected_payment_method: None,
            notes: request.notes,
            can_confirm: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        };

        self.recompute(&mut session).await?;
        self.store(&session).await?;
        info!(session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    /// Loads a session owned by `identity`. Expired or foreign sessions read
    /// as missing.
    pub async fn get(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<CheckoutSession, ServiceError> {
        let not_found =
            || ServiceError::NotFound(format!("Checkout session {} not found", session_id));

        let raw = self
            .cache
            .get(&session_key(session_id))
            .await?
            .ok_or_else(not_found)?;
        let session: CheckoutSession = serde_json::from_str(&raw)?;

        if session.is_expired_at(Utc::now())
            || !identity.owns(session.user_id, session.guest_id.as_deref())
        {
            return Err(not_found());
        }
        Ok(session)
    }

    #[instrument(skip(self, identity, address), fields(session_id = %session_id))]
    pub async fn update_address(
        &self,
        session_id: &str,
        identity: &Identity,
        address: Address,
    ) -> Result<CheckoutSession, ServiceError> {
        address.validate()?;
        self.mutate(session_id, identity, |session| {
            session.shipping_address = Some(address);
            Ok(())
        })
        .await
    }

    /// Sets or, with `None` or a blank code, removes the discount code.
    #[instrument(skip(self, identity), fields(session_id = %session_id))]
    pub async fn update_discount(
        &self,
        session_id: &str,
        identity: &Identity,
        code: Option<String>,
    ) -> Result<CheckoutSession, ServiceError> {
        self.mutate(session_id, identity, |session| {
            session.discount_code = normalize_code(code);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, identity), fields(session_id = %session_id))]
    pub async fn update_shipping_method(
        &self,
        session_id: &str,
        identity: &Identity,
        option_id: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        self.mutate(session_id, identity, |session| {
            let available = session
                .shipping_options
                .iter()
                .any(|option| option.id == option_id && option.available);
            if !available {
                return Err(ServiceError::ValidationError(format!(
                    "Shipping option {} is not available for this checkout",
                    option_id
                )));
            }
            session.selected_shipping = Some(option_id.to_string());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, identity), fields(session_id = %session_id))]
    pub async fn update_payment_method(
        &self,
        session_id: &str,
        identity: &Identity,
        method_id: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        self.mutate(session_id, identity, |session| {
            if !session.payment_methods.iter().any(|m| m.id == method_id) {
                return Err(ServiceError::ValidationError(format!(
                    "Payment method {} is not available for this checkout",
                    method_id
                )));
            }
            session.selected_payment_method = Some(method_id.to_string());
            Ok(())
        })
        .await
    }

    /// Re-reads catalog prices into the session. Each line whose price moved
    /// gets a warning naming the old and new price.
    #[instrument(skip(self, identity), fields(session_id = %session_id))]
    pub async fn requote(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut session = self.get(session_id, identity).await?;

        let variant_ids: Vec<Uuid> = session.items.iter().map(|l| l.variant_id).collect();
        let variants = with_timeout(
            self.call_timeout,
            "catalog",
            self.catalog.get_variants(&variant_ids),
        )
        .await?;

        let mut changes = Vec::new();
        for line in &mut session.items {
            match variants.get(&line.variant_id) {
                Some(variant) if variant.live_price != line.unit_price => {
                    changes.push(format!(
                        "Price of {} changed from {} to {}",
                        line.name, line.unit_price, variant.live_price
                    ));
                    line.unit_price = variant.live_price;
                }
                Some(_) => {}
                None => changes.push(format!("{} is no longer for sale", line.name)),
            }
        }

        self.recompute(&mut session).await?;
        session.warnings.extend(changes);
        self.store(&session).await?;
        info!(%session_id, "Checkout session re-quoted");
        Ok(session)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), ServiceError> {
        self.cache.delete(&session_key(session_id)).await?;
        debug!(%session_id, "Checkout session deleted");
        Ok(())
    }

    /// Fresh recompute of a loaded session, used right before confirmation.
    pub async fn refresh(&self, session: &mut CheckoutSession) -> Result<(), ServiceError> {
        self.recompute(session).await
    }

    async fn mutate<F>(
        &self,
        session_id: &str,
        identity: &Identity,
        apply: F,
    ) -> Result<CheckoutSession, ServiceError>
    where
        F: FnOnce(&mut CheckoutSession) -> Result<(), ServiceError>,
    {
        let mut session = self.get(session_id, identity).await?;
        apply(&mut session)?;
        self.recompute(&mut session).await?;
        self.store(&session).await?;
        Ok(session)
    }

    /// Writes the whole session with whatever is left of its lifetime.
    async fn store(&self, session: &CheckoutSession) -> Result<(), ServiceError> {
        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|left| !left.is_zero())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", session.id))
            })?;
        let payload = serde_json::to_string(session)?;
        self.cache
            .set(&session_key(&session.id), &payload, Some(remaining))
            .await?;
        Ok(())
    }

    /// Re-derives stock, totals, shipping, payment methods and
    /// `can_confirm` from the session's inputs.
    async fn recompute(&self, session: &mut CheckoutSession) -> Result<(), ServiceError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let variant_ids: Vec<Uuid> = session.items.iter().map(|l| l.variant_id).collect();
        let stock = self.inventory.available_stock_many(&variant_ids).await?;
        for line in &mut session.items {
            let available = stock.get(&line.variant_id).copied().unwrap_or(0);
            line.line_total = line.unit_price * Decimal::from(line.quantity);
            line.available_stock = available;
            line.stock_status = if available <= 0 {
                StockStatus::OutOfStock
            } else if available < line.quantity {
                StockStatus::Insufficient
            } else {
                StockStatus::InStock
            };
            match line.stock_status {
                StockStatus::OutOfStock => errors.push(format!("{} is out of stock", line.name)),
                StockStatus::Insufficient => errors.push(format!(
                    "Only {} of {} left in stock",
                    available, line.name
                )),
                StockStatus::InStock => {}
            }
        }

        let lines: Vec<PricingLine> = session.items.iter().map(SessionLine::pricing_line).collect();
        let quote = self
            .pricing
            .price(&lines, session.discount_code.as_deref(), session.user_id)
            .await;
        if session.discount_code.is_some() && !quote.discount_applied {
            if let Some(reason) = &quote.discount_detail {
                warnings.push(reason.clone());
            }
        }
        session.subtotal_amount = quote.subtotal;
        session.discount_amount = quote.discount_amount;
        session.discount_detail = quote.discount_detail.clone();

        self.refresh_shipping(session, &mut warnings).await;
        session.shipping_amount = session
            .selected_shipping_option()
            .map(|option| option.amount)
            .unwrap_or(Decimal::ZERO);

        session.tax_amount = Decimal::ZERO;
        session.total_amount = quote.total_with_shipping(session.shipping_amount) + session.tax_amount;

        session.payment_methods = self.payments.list_available_methods(session.total_amount);
        if let Some(selected) = session.selected_payment_method.clone() {
            if !session.payment_methods.iter().any(|m| m.id == selected) {
                session.selected_payment_method = None;
                warnings.push(format!(
                    "Payment method {} is no longer available for this order",
                    selected
                ));
            }
        }

        if session.shipping_address.is_none() {
            errors.push("Shipping address is required".to_string());
        } else if session.selected_shipping.is_none() {
            errors.push("No shipping option is available for this address".to_string());
        }
        if session.selected_payment_method.is_none() {
            errors.push("Select a payment method".to_string());
        }

        session.can_confirm = errors.is_empty();
        session.errors = errors;
        session.warnings = warnings;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn refresh_shipping(&self, session: &mut CheckoutSession, warnings: &mut Vec<String>) {
        let Some(address) = &session.shipping_address else {
            session.shipping_options.clear();
            session.selected_shipping = None;
            return;
        };

        let parcel: Vec<ShippingItem> = session
            .items
            .iter()
            .map(|line| ShippingItem {
                variant_id: line.variant_id,
                quantity: line.quantity,
                weight_grams: line.weight_grams,
                line_total: line.line_total,
            })
            .collect();

        session.shipping_options = match with_timeout(
            self.call_timeout,
            "shipping rates",
            self.shipping.quote(address, &parcel),
        )
        .await
        {
            Ok(options) => options,
            Err(e) => {
                warn!(error = %e, "Shipping quote failed");
                warnings.push("Shipping rates are temporarily unavailable".to_string());
                Vec::new()
            }
        };

        let still_available = session
            .selected_shipping_option()
            .map(|option| option.available)
            .unwrap_or(false);
        if !still_available {
            if let Some(previous) = session.selected_shipping.take() {
                warnings.push(format!("Shipping option {} is no longer available", previous));
            }
            session.selected_shipping = session
                .shipping_options
                .iter()
                .filter(|option| option.available)
                .min_by(|a, b| a.amount.cmp(&b.amount))
                .map(|option| option.id.clone());
        }
    }
}

fn normalize_code(code: Option<String>) -> Option<String> {
    code.map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
}
