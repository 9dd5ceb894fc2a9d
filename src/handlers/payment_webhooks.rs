use axum::{
    extract::{Path, RawQuery, State},
    response::Json,
};
use axum::body::Bytes;
use serde::Serialize;
use tracing::info;
use url::form_urlencoded;
use utoipa::ToSchema;

use crate::{errors::ServiceError, services::payments::CallbackParams, AppState};

/// Acknowledgement in the shape gateways expect back.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    #[serde(rename = "RspCode")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

/// Query-string and form-body parameters together; the body wins on clashes.
fn collect_params(query: Option<&str>, body: &[u8]) -> CallbackParams {
    let mut params = CallbackParams::new();
    if let Some(query) = query {
        params.extend(form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    params.extend(form_urlencoded::parse(body).into_owned());
    params
}

// GET|POST /api/v1/payments/webhook/{provider}
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook/{provider}",
    params(("provider" = String, Path, description = "Payment provider id, e.g. paygate")),
    request_body(content = String, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Callback acknowledged; the outcome is in RspCode", body = WebhookAck),
        (status = 404, description = "Unknown provider", body = crate::errors::ErrorResponse),
        (status = 503, description = "Temporarily unavailable; the provider should retry", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let params = collect_params(query.as_deref(), &body);
    let outcome = state
        .services
        .payments
        .handle_callback(&provider, &params)
        .await?;

    info!(%provider, code = outcome.ack_code(), "Payment webhook acknowledged");
    Ok(Json(WebhookAck {
        code: outcome.ack_code().to_string(),
        message: outcome.message().to_string(),
    }))
}
