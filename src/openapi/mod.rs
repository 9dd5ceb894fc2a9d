use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Order Fulfillment API",
        version = "1.0.0",
        description = r#"
# Order Fulfillment API

Checkout sessions, order placement and payment reconciliation.

## Identity

Requests arrive already authenticated. The caller is identified by the
`X-User-Id` header (a UUID) or, for anonymous shoppers, `X-Guest-Id`.
`X-User-Roles: admin` grants access to every order.

## Idempotency

`POST /checkout/sessions/{id}/confirm` requires an `Idempotency-Key` header.
Retrying with the same key and body returns the first result; the same key
with a different body is rejected with `409 idempotency_conflict`.

## Errors

Every failure uses one body shape. Stock and price conflicts carry enough
detail in `details` to re-quote:

```json
{
  "error": "Conflict",
  "code": "insufficient_stock",
  "message": "Insufficient stock for Linen Shirt / M: requested 3, available 1",
  "details": {"product_name": "Linen Shirt / M", "available": 1, "requested": 3},
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Checkout sessions and order placement"),
        (name = "Orders", description = "Order lookup and lifecycle actions"),
        (name = "Payments", description = "Payment provider callbacks"),
        (name = "Shipping", description = "Carrier status pushes"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Checkout
        crate::handlers::checkout::create_session,
        crate::handlers::checkout::get_session,
        crate::handlers::checkout::update_address,
        crate::handlers::checkout::update_discount,
        crate::handlers::checkout::update_shipping_method,
        crate::handlers::checkout::update_payment_method,
        crate::handlers::checkout::requote_session,
        crate::handlers::checkout::confirm_checkout,

        // Orders
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_by_number,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::return_order,
        crate::handlers::orders::refund_order,
        crate::handlers::orders::retry_payment,
        crate::handlers::orders::merge_guest_orders,

        // Webhooks
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::shipping_webhooks::carrier_webhook,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,

            // Checkout types
            crate::services::commerce::checkout_session_service::CreateSessionRequest,
            crate::services::commerce::checkout_session_service::SessionItemInput,
            crate::services::commerce::checkout_session_service::SessionLine,
            crate::services::commerce::checkout_session_service::StockStatus,
            crate::services::commerce::CheckoutSession,
            crate::services::commerce::ConfirmCheckoutRequest,
            crate::services::commerce::CheckoutConfirmation,
            crate::services::commerce::PriceQuote,
            crate::integrations::Address,
            crate::integrations::ShippingOption,
            crate::services::payments::PaymentMethod,
            crate::handlers::checkout::DiscountCodeRequest,
            crate::handlers::checkout::ShippingMethodRequest,
            crate::handlers::checkout::PaymentMethodRequest,

            // Order types
            crate::entities::order::OrderStatus,
            crate::services::orders::OrderDetails,
            crate::services::orders::CarrierStatus,
            crate::services::orders::CarrierUpdateOutcome,
            crate::handlers::orders::CancelOrderRequest,
            crate::handlers::orders::RetryPaymentRequest,
            crate::handlers::orders::MergeGuestOrdersResponse,

            // Webhook types
            crate::handlers::payment_webhooks::WebhookAck,
            crate::handlers::shipping_webhooks::CarrierWebhookPayload,
            crate::services::payments::CallbackOutcome,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDocV1::openapi())
}
