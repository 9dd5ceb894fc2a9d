use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::Identity,
    entities::order,
    errors::ServiceError,
    services::{commerce::CheckoutConfirmation, orders::OrderDetails},
    ApiResponse, AppState,
};

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct CancelOrderRequest {
    #[serde(default)]
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RetryPaymentRequest {
    pub method_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MergeGuestOrdersResponse {
    pub merged: u64,
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/merge-guest", post(merge_guest_orders))
        .route("/by-number/:order_number", get(get_order_by_number))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/return", post(return_order))
        .route("/:id/refund", post(refund_order))
        .route("/:id/payments", post(retry_payment))
}

/// Orders someone else owns are reported as missing.
fn ensure_access(identity: &Identity, order: &order::Model) -> Result<(), ServiceError> {
    if identity.can_access(order.user_id, order.guest_id.as_deref()) {
        Ok(())
    } else {
        Err(ServiceError::NotFound(format!("Order {} not found", order.id)))
    }
}

async fn load_accessible(
    state: &AppState,
    identity: &Identity,
    order_id: Uuid,
) -> Result<OrderDetails, ServiceError> {
    let details = state.services.orders.get(order_id).await?;
    ensure_access(identity, &details.order)?;
    Ok(details)
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order with items and payment attempts", body = ApiResponse<OrderDetails>),
        (status = 401, description = "No caller identity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Identity,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let details = load_accessible(&state, &identity, id).await?;
    Ok(Json(ApiResponse::success(details)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/by-number/{order_number}",
    summary = "Get order by number",
    params(("order_number" = String, Path, description = "Public order number, e.g. ORD-20240601-7KQ2ZD")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderDetails>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    identity: Identity,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let order = state.services.orders.find_by_number(&order_number).await?;
    ensure_access(&identity, &order)?;
    let details = state.services.orders.get(order.id).await?;
    Ok(Json(ApiResponse::success(details)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel order",
    description = "Cancels a PENDING or CONFIRMED order and puts its stock back",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Identity,
    Json(payload): Json<CancelOrderRequest>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    payload.validate()?;
    load_accessible(&state, &identity, id).await?;
    let order = state.services.orders.cancel(id, payload.reason).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/return",
    summary = "Return a delivered order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order returned; stock is back on hand"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not delivered", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn return_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Identity,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    load_accessible(&state, &identity, id).await?;
    let order = state.services.orders.request_return(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund",
    summary = "Mark order refunded (admin)",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order refunded"),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is neither delivered nor returned", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Identity,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    identity.require_admin()?;
    let order = state.services.orders.refund(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payments",
    summary = "Retry payment",
    description = "Opens a new payment for an order still awaiting payment; earlier attempts are superseded",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = RetryPaymentRequest,
    responses(
        (status = 201, description = "New payment opened", body = ApiResponse<CheckoutConfirmation>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not awaiting payment", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: Identity,
    Json(payload): Json<RetryPaymentRequest>,
) -> Result<(axum::http::StatusCode, Json<ApiResponse<CheckoutConfirmation>>), ServiceError> {
    let confirmation = state
        .services
        .checkout
        .retry_payment(id, &identity, &payload.method_id)
        .await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(ApiResponse::success(confirmation)),
    ))
}

/// Moves the caller's guest orders to their account. The request must carry
/// both the signed-in user and the guest identity being claimed.
#[utoipa::path(
    post,
    path = "/api/v1/orders/merge-guest",
    summary = "Claim guest orders",
    responses(
        (status = 200, description = "Number of orders moved", body = ApiResponse<MergeGuestOrdersResponse>),
        (status = 400, description = "Missing user or guest identity", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn merge_guest_orders(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<ApiResponse<MergeGuestOrdersResponse>>, ServiceError> {
    let (Some(user_id), Some(guest_id)) = (identity.user_id, identity.guest_id.as_deref()) else {
        return Err(ServiceError::ValidationError(
            "Both a signed-in user and a guest identity are required".to_string(),
        ));
    };
    let merged = state
        .services
        .orders
        .merge_guest_orders(guest_id, user_id)
        .await?;
    Ok(Json(ApiResponse::success(MergeGuestOrdersResponse { merged })))
}
