use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::{
    auth::Identity,
    errors::ServiceError,
    integrations::Address,
    services::commerce::{
        CheckoutConfirmation, CheckoutSession, ConfirmCheckoutRequest, CreateSessionRequest,
    },
    ApiResponse, AppState,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize, ToSchema)]
pub struct DiscountCodeRequest {
    /// Code to apply; null or blank removes the current one
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ShippingMethodRequest {
    pub option_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PaymentMethodRequest {
    pub method_id: String,
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/address", put(update_address))
        .route("/sessions/:id/discount", put(update_discount))
        .route("/sessions/:id/shipping-method", put(update_shipping_method))
        .route("/sessions/:id/payment-method", put(update_payment_method))
        .route("/sessions/:id/requote", post(requote_session))
        .route("/sessions/:id/confirm", post(confirm_checkout))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout/sessions",
    summary = "Start checkout",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Invalid items or address", body = crate::errors::ErrorResponse),
        (status = 401, description = "No caller identity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown product variant", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn create_session(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.sessions.create(&identity, payload).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}

/// Returns the session with stock and totals recomputed against live data.
#[utoipa::path(
    get,
    path = "/api/v1/checkout/sessions/{id}",
    summary = "Get checkout session",
    params(("id" = String, Path, description = "Checkout session id")),
    responses(
        (status = 200, description = "Session", body = ApiResponse<CheckoutSession>),
        (status = 404, description = "Session unknown, expired or owned by someone else", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let mut session = state.services.sessions.get(&id, &identity).await?;
    state.services.sessions.refresh(&mut session).await?;
    Ok(Json(ApiResponse::success(session)))
}

#[utoipa::path(
    put,
    path = "/api/v1/checkout/sessions/{id}/address",
    summary = "Set shipping address",
    params(("id" = String, Path, description = "Checkout session id")),
    request_body = Address,
    responses(
        (status = 200, description = "Session updated", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Invalid address", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn update_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
    Json(address): Json<Address>,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let session = state
        .services
        .sessions
        .update_address(&id, &identity, address)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[utoipa::path(
    put,
    path = "/api/v1/checkout/sessions/{id}/discount",
    summary = "Apply or remove a discount code",
    params(("id" = String, Path, description = "Checkout session id")),
    request_body = DiscountCodeRequest,
    responses(
        (status = 200, description = "Session updated; a refused code shows up as a warning", body = ApiResponse<CheckoutSession>),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn update_discount(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
    Json(payload): Json<DiscountCodeRequest>,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let session = state
        .services
        .sessions
        .update_discount(&id, &identity, payload.code)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[utoipa::path(
    put,
    path = "/api/v1/checkout/sessions/{id}/shipping-method",
    summary = "Select a shipping option",
    params(("id" = String, Path, description = "Checkout session id")),
    request_body = ShippingMethodRequest,
    responses(
        (status = 200, description = "Session updated", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Option not offered for this checkout", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn update_shipping_method(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
    Json(payload): Json<ShippingMethodRequest>,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let session = state
        .services
        .sessions
        .update_shipping_method(&id, &identity, &payload.option_id)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

#[utoipa::path(
    put,
    path = "/api/v1/checkout/sessions/{id}/payment-method",
    summary = "Select a payment method",
    params(("id" = String, Path, description = "Checkout session id")),
    request_body = PaymentMethodRequest,
    responses(
        (status = 200, description = "Session updated", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Method not available for this total", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn update_payment_method(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
    Json(payload): Json<PaymentMethodRequest>,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let session = state
        .services
        .sessions
        .update_payment_method(&id, &identity, &payload.method_id)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

/// Pulls current catalog prices into the session, e.g. after a confirm
/// failed with a price conflict.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/sessions/{id}/requote",
    summary = "Re-quote checkout session",
    params(("id" = String, Path, description = "Checkout session id")),
    responses(
        (status = 200, description = "Session re-priced", body = ApiResponse<CheckoutSession>),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn requote_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
) -> Result<Json<ApiResponse<CheckoutSession>>, ServiceError> {
    let session = state.services.sessions.requote(&id, &identity).await?;
    Ok(Json(ApiResponse::success(session)))
}

/// Places the order. Requires an `Idempotency-Key` header; repeating a
/// request with the same key returns the first result.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/sessions/{id}/confirm",
    summary = "Confirm checkout",
    params(
        ("id" = String, Path, description = "Checkout session id"),
        ("Idempotency-Key" = String, Header, description = "Client-chosen key, reused on retries"),
    ),
    request_body = ConfirmCheckoutRequest,
    responses(
        (status = 201, description = "Order placed", body = ApiResponse<CheckoutConfirmation>),
        (status = 400, description = "Session not ready or key missing", body = crate::errors::ErrorResponse),
        (status = 404, description = "Session not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Stock, price or idempotency conflict", body = crate::errors::ErrorResponse),
        (status = 503, description = "Temporarily unavailable; retry with the same key", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn confirm_checkout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    identity: Identity,
    headers: HeaderMap,
    Json(payload): Json<ConfirmCheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ServiceError::ValidationError("Idempotency-Key header is required".to_string())
        })?;

    let confirmation = state
        .services
        .checkout
        .confirm_checkout(&id, &identity, key, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(confirmation))))
}
