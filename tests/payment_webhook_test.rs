mod common;

use assert_matches::assert_matches;
use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
};
use common::{shopper, TestApp};
use order_fulfillment::{
    entities::{order::OrderStatus, payment::PaymentStatus},
    errors::ServiceError,
    services::payments::{hosted, CallbackOutcome, CallbackParams, COD_METHOD},
};
use rust_decimal_macros::dec;
use url::form_urlencoded;
use uuid::Uuid;

const GATEWAY: &str = "paygate";

fn encode(params: &CallbackParams) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

#[tokio::test]
async fn successful_callback_confirms_and_captures() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;

    assert_eq!(app.pay(&confirmation).await, CallbackOutcome::Processed);

    let order = app.order(confirmation.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(order.paid_at.is_some());
    assert_eq!(order.version, 2);

    let payments = app.payments_of(confirmation.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::Captured);
    assert!(payments[0].paid_at.is_some());
    assert!(payments[0].provider_txn_ref.is_some());
    // Stock stays reserved until delivery
    assert_eq!(app.stock(shirt).await.quantity_reserved, 1);
}

#[tokio::test]
async fn duplicate_callback_changes_nothing() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;

    assert_eq!(app.pay(&confirmation).await, CallbackOutcome::Processed);
    let after_first = app.order(confirmation.order_id).await;

    let outcome = app.pay(&confirmation).await;
    assert_eq!(outcome, CallbackOutcome::Duplicate);
    assert_eq!(outcome.ack_code(), "02");
    assert_eq!(app.order(confirmation.order_id).await, after_first);
}

#[tokio::test]
async fn tampered_callback_is_rejected() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;

    let mut params = hosted::signed_callback(
        &app.gateway,
        confirmation.payment_id,
        confirmation.total_amount,
        "00",
    )
    .unwrap();
    params.insert("pg_Amount".into(), "100".into());

    let outcome = app
        .services()
        .payments
        .handle_callback(hosted::PROVIDER_ID, &params)
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::InvalidSignature);
    assert_eq!(outcome.ack_code(), "97");
    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Pending
    );
}

#[tokio::test]
async fn wrong_amount_is_not_applied() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;

    let outcome = app
        .gateway_callback(confirmation.payment_id, dec!(1000), "00")
        .await;
    assert_eq!(outcome, CallbackOutcome::AmountMismatch);
    assert_eq!(outcome.ack_code(), "04");

    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Pending
    );
    assert_eq!(
        app.payments_of(confirmation.order_id).await[0].status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn unknown_payment_is_reported_not_found() {
    let app = TestApp::new().await;
    let outcome = app
        .gateway_callback(Uuid::new_v4(), dec!(100000), "00")
        .await;
    assert_eq!(outcome, CallbackOutcome::NotFound);
    assert_eq!(outcome.ack_code(), "01");
}

#[tokio::test]
async fn declined_payment_can_be_retried() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let confirmation = app.place_order(&buyer, &[(shirt, 1)], GATEWAY).await;

    let declined = app
        .gateway_callback(confirmation.payment_id, confirmation.total_amount, "24")
        .await;
    assert_eq!(declined, CallbackOutcome::Declined);
    assert_eq!(declined.ack_code(), "00");
    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Pending
    );
    assert_eq!(
        app.payments_of(confirmation.order_id).await[0].status,
        PaymentStatus::Failed
    );
    // Repeating the decline is a duplicate
    assert_eq!(
        app.gateway_callback(confirmation.payment_id, confirmation.total_amount, "24")
            .await,
        CallbackOutcome::Duplicate
    );

    let retry = app
        .services()
        .checkout
        .retry_payment(confirmation.order_id, &buyer, GATEWAY)
        .await
        .unwrap();
    assert_ne!(retry.payment_id, confirmation.payment_id);
    assert_eq!(retry.order_id, confirmation.order_id);
    assert_eq!(retry.status, OrderStatus::Pending);

    assert_eq!(app.pay(&retry).await, CallbackOutcome::Processed);
    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Confirmed
    );
}

#[tokio::test]
async fn retry_supersedes_the_pending_attempt() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let confirmation = app.place_order(&buyer, &[(shirt, 1)], GATEWAY).await;

    let retry = app
        .services()
        .checkout
        .retry_payment(confirmation.order_id, &buyer, GATEWAY)
        .await
        .unwrap();

    let payments = app.payments_of(confirmation.order_id).await;
    assert_eq!(payments.len(), 2);
    let live: Vec<_> = payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Pending)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, retry.payment_id);

    // Money for the superseded attempt still pays the order
    assert_eq!(app.pay(&confirmation).await, CallbackOutcome::Processed);
    assert_eq!(app.pay(&retry).await, CallbackOutcome::Duplicate);
}

#[tokio::test]
async fn retry_is_refused_for_foreign_or_settled_orders() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let confirmation = app.place_order(&buyer, &[(shirt, 1)], GATEWAY).await;
    let checkout = &app.services().checkout;

    assert_matches!(
        checkout
            .retry_payment(confirmation.order_id, &shopper(), GATEWAY)
            .await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        checkout
            .retry_payment(confirmation.order_id, &buyer, COD_METHOD)
            .await,
        Err(ServiceError::ValidationError(_))
    );

    app.pay(&confirmation).await;
    assert_matches!(
        checkout
            .retry_payment(confirmation.order_id, &buyer, GATEWAY)
            .await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn money_for_a_cancelled_order_is_flagged() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;

    app.services()
        .orders
        .cancel(confirmation.order_id, Some("changed my mind".to_string()))
        .await
        .unwrap();

    let outcome = app.pay(&confirmation).await;
    assert_eq!(outcome, CallbackOutcome::Unpayable);
    assert_eq!(outcome.ack_code(), "99");
    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Cancelled
    );
}

#[tokio::test]
async fn webhook_endpoint_accepts_query_and_form_callbacks() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(shirt, 1)], GATEWAY).await;
    let params = hosted::signed_callback(
        &app.gateway,
        confirmation.payment_id,
        confirmation.total_amount,
        "00",
    )
    .unwrap();

    let (status, body) = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/webhook/paygate?{}", encode(&params)),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["RspCode"], "00");
    assert_eq!(body["Message"], "Confirm success");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook/paygate")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(encode(&params)))
        .unwrap();
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["RspCode"], "02");
}

#[tokio::test]
async fn webhook_endpoint_reports_bad_signatures_in_the_ack() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::GET,
            "/api/v1/payments/webhook/paygate?pg_TxnRef=abc&pg_Amount=100&pg_SecureHash=00",
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["RspCode"], "97");

    let (status, body) = app
        .request(Method::GET, "/api/v1/payments/webhook/nope?x=1", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
