use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::CacheError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "code": "insufficient_stock",
    "message": "Insufficient stock for Linen Shirt / M: requested 3, available 1",
    "details": {"product_name": "Linen Shirt / M", "available": 1, "requested": 3},
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Structured details letting the client re-quote (stock levels, old and new price)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub details: Option<serde_json::Value>,
    /// Request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Idempotency key was already used with a different request")]
    IdempotencyConflict,

    #[error("Insufficient stock for {product_name}: requested {requested}, available {available}")]
    InsufficientStock {
        product_name: String,
        available: i32,
        requested: i32,
    },

    #[error("Price changed for {product_name}: quoted {quoted}, current {current}")]
    PriceChanged {
        product_name: String,
        quoted: Decimal,
        current: Decimal,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Gateway signature invalid")]
    GatewaySignatureInvalid,

    #[error("Temporarily unavailable: {0}")]
    TransientInfra(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        if crate::db::is_transient(&err) {
            ServiceError::TransientInfra(err.to_string())
        } else {
            ServiceError::DatabaseError(err)
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Serialization(e) => ServiceError::SerializationError(e.to_string()),
            other => ServiceError::TransientInfra(other.to_string()),
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::GatewaySignatureInvalid => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_)
            | Self::ConcurrentModification(_)
            | Self::IdempotencyConflict
            | Self::InsufficientStock { .. }
            | Self::PriceChanged { .. }
            | Self::InvalidStatus(_) => StatusCode::CONFLICT,
            Self::TransientInfra(_) | Self::CacheError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code clients can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                "internal_error"
            }
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::PriceChanged { .. } => "price_changed",
            Self::InvalidStatus(_) => "invalid_status",
            Self::GatewaySignatureInvalid => "invalid_signature",
            Self::TransientInfra(_) | Self::CacheError(_) => "temporarily_unavailable",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            Self::TransientInfra(_) | Self::CacheError(_) => {
                "Service temporarily unavailable, please retry".to_string()
            }
            Self::GatewaySignatureInvalid => "Unauthorized".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured details for business-rule failures.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InsufficientStock {
                product_name,
                available,
                requested,
            } => Some(json!({
                "product_name": product_name,
                "available": available,
                "requested": requested,
            })),
            Self::PriceChanged {
                product_name,
                quoted,
                current,
            } => Some(json!({
                "product_name": product_name,
                "quoted_price": quoted,
                "current_price": current,
            })),
            _ => None,
        }
    }

    /// Failures worth retrying with the same request: lock contention,
    /// timeouts and unexpected infrastructure errors. Business-rule
    /// failures are deterministic and are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientInfra(_)
                | Self::CacheError(_)
                | Self::DatabaseError(_)
                | Self::InternalError(_)
                | Self::SerializationError(_)
        )
    }

    /// Lock timeouts and deadlocks that a transaction retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            Self::GatewaySignatureInvalid => {
                tracing::warn!("Rejected request with invalid signature")
            }
            e if status.is_server_error() => tracing::error!(error = %e, "Request failed"),
            _ => {}
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
