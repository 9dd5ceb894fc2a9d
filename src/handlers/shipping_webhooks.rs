use axum::{body::Bytes, extract::State, http::HeaderMap, response::Json};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    services::orders::{CarrierStatus, CarrierUpdateOutcome},
    ApiResponse, AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";
const SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CarrierWebhookPayload {
    pub order_number: String,
    pub status: CarrierStatus,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

// POST /api/v1/shipping/webhook
#[utoipa::path(
    post,
    path = "/api/v1/shipping/webhook",
    request_body = CarrierWebhookPayload,
    responses(
        (status = 200, description = "Status applied, or ignored as stale", body = ApiResponse<CarrierUpdateOutcome>),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not in a shippable state", body = crate::errors::ErrorResponse)
    ),
    tag = "Shipping"
)]
pub async fn carrier_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<CarrierUpdateOutcome>>, ServiceError> {
    if let Some(secret) = state.config.carrier_webhook_secret.as_deref() {
        let now = chrono::Utc::now().timestamp();
        if !verify_signature(&headers, &body, secret, now) {
            metrics::counter!("shipping.webhook.invalid_signature", 1);
            return Err(ServiceError::GatewaySignatureInvalid);
        }
    }

    let payload: CarrierWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid carrier payload: {}", e)))?;

    let outcome = state
        .services
        .orders
        .apply_carrier_update(&payload.order_number, payload.status, payload.tracking_number)
        .await?;

    if outcome.changed {
        info!(order_number = %outcome.order_number, status = ?outcome.status, "Carrier update applied");
    } else {
        info!(order_number = %outcome.order_number, "Carrier update ignored as stale");
    }
    Ok(Json(ApiResponse::success(outcome)))
}

/// HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded, with the timestamp
/// no further than five minutes from `now`.
fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str, now: i64) -> bool {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let (Some(ts), Some(signature)) = (header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER)) else {
        warn!("Carrier webhook is missing its signature headers");
        return false;
    };
    let Ok(ts_secs) = ts.parse::<i64>() else {
        return false;
    };
    if (now - ts_secs).unsigned_abs() > SIGNATURE_TOLERANCE_SECS {
        warn!("Carrier webhook timestamp outside tolerance");
        return false;
    }
    let Ok(signature) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Signature headers for `payload`, as a carrier would compute them.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}
