mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{
    address, session_request, shopper, RecordingCart, SwitchableShipping, TestApp,
    UnreachableDiscounts,
};
use order_fulfillment::{
    auth::Identity,
    entities::{
        inventory_reservation::ReservationStatus,
        order::{self, OrderStatus},
        payment::PaymentStatus,
    },
    errors::ServiceError,
    services::{commerce::ConfirmCheckoutRequest, payments::COD_METHOD},
};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use uuid::Uuid;

const GATEWAY: &str = "paygate";

async fn order_count(app: &TestApp) -> u64 {
    order::Entity::find().count(&*app.state.db).await.unwrap()
}

#[tokio::test]
async fn online_checkout_reserves_stock_and_opens_a_payment() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let session = app.open_session(&buyer, &[(shirt, 2)], GATEWAY).await;
    assert!(session.can_confirm, "errors: {:?}", session.errors);
    assert_eq!(session.subtotal_amount, dec!(500000));
    assert_eq!(session.shipping_amount, dec!(30000));
    assert_eq!(session.total_amount, dec!(530000));

    let confirmation = app.confirm(&buyer, &session.id, "key-1").await.unwrap();
    assert_eq!(confirmation.status, OrderStatus::Pending);
    assert_eq!(confirmation.total_amount, dec!(530000));
    assert_eq!(confirmation.payment_method, GATEWAY);
    assert!(confirmation
        .payment_url
        .starts_with(&app.state.config.gateway_base_url));
    assert!(confirmation.payment_url.contains(&confirmation.payment_id.to_string()));
    assert!(confirmation.payment_expires_at.is_some());

    let details = app
        .services()
        .orders
        .get(confirmation.order_id)
        .await
        .unwrap();
    assert_eq!(details.order.user_id, buyer.user_id);
    assert_eq!(details.order.version, 1);
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].total_amount, dec!(500000));
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.payments[0].status, PaymentStatus::Pending);
    assert_eq!(details.payments[0].amount, dec!(530000));

    let level = app.stock(shirt).await;
    assert_eq!(level.quantity_on_hand, 5);
    assert_eq!(level.quantity_reserved, 2);
    let reservations = app
        .services()
        .inventory
        .reservations_for(confirmation.order_id)
        .await
        .unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Active);

    // The session is consumed by the order
    assert_matches!(
        app.services().sessions.get(&session.id, &buyer).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn cash_on_delivery_orders_are_confirmed_immediately() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = Identity::guest("guest-cod");

    let confirmation = app.place_order(&buyer, &[(shirt, 1)], COD_METHOD).await;

    assert_eq!(confirmation.status, OrderStatus::Confirmed);
    assert_eq!(confirmation.payment_method, COD_METHOD);
    assert!(confirmation.payment_expires_at.is_none());
    assert!(confirmation.payment_url.ends_with(&confirmation.order_number));

    let order = app.order(confirmation.order_id).await;
    assert_eq!(order.guest_id.as_deref(), Some("guest-cod"));
    assert!(order.user_id.is_none());
    assert!(order.paid_at.is_none());
    let payments = app.payments_of(confirmation.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(app.stock(shirt).await.quantity_reserved, 1);
}

#[tokio::test]
async fn price_change_blocks_confirmation() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let session = app.open_session(&buyer, &[(shirt, 1)], GATEWAY).await;

    app.set_price(shirt, dec!(275000)).await;

    let err = app.confirm(&buyer, &session.id, "key-price").await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::PriceChanged { ref product_name, quoted, current }
            if product_name == "Linen Shirt" && quoted == dec!(250000) && current == dec!(275000)
    );
    assert_eq!(order_count(&app).await, 0);
    assert_eq!(app.stock(shirt).await.quantity_reserved, 0);
}

#[tokio::test]
async fn requoted_session_confirms_at_the_new_price() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let session = app.open_session(&buyer, &[(shirt, 2)], GATEWAY).await;

    app.set_price(shirt, dec!(275000)).await;
    assert_matches!(
        app.confirm(&buyer, &session.id, "before-requote").await,
        Err(ServiceError::PriceChanged { .. })
    );

    let requoted = app
        .services()
        .sessions
        .requote(&session.id, &buyer)
        .await
        .unwrap();
    assert_eq!(requoted.items[0].unit_price, dec!(275000));
    assert_eq!(requoted.subtotal_amount, dec!(550000));
    assert!(requoted.can_confirm);
    assert!(requoted
        .warnings
        .iter()
        .any(|w| w.contains("Linen Shirt") && w.contains("275000")));
    assert_eq!(
        requoted.selected_payment_method.as_deref(),
        Some(GATEWAY)
    );

    let confirmation = app
        .confirm(&buyer, &session.id, "after-requote")
        .await
        .unwrap();
    assert_eq!(confirmation.total_amount, requoted.total_amount);
    let details = app
        .services()
        .orders
        .get(confirmation.order_id)
        .await
        .unwrap();
    assert_eq!(details.items[0].unit_price, dec!(275000));
    assert_eq!(order_count(&app).await, 1);
}

#[tokio::test]
async fn requote_without_price_moves_adds_no_warning() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let session = app.open_session(&buyer, &[(shirt, 1)], GATEWAY).await;

    let requoted = app
        .services()
        .sessions
        .requote(&session.id, &buyer)
        .await
        .unwrap();
    assert_eq!(requoted.items, session.items);
    assert!(requoted.warnings.iter().all(|w| !w.starts_with("Price of")));

    assert_matches!(
        app.services().sessions.requote(&session.id, &shopper()).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn session_without_shipping_rates_cannot_be_confirmed() {
    let shipping = Arc::new(SwitchableShipping::unreachable());
    let app = TestApp::builder().shipping(shipping.clone()).build().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let session = app.open_session(&buyer, &[(shirt, 1)], GATEWAY).await;
    assert!(!session.can_confirm);
    assert!(session.selected_shipping.is_none());
    assert!(session
        .errors
        .iter()
        .any(|e| e.contains("No shipping option")));
    assert!(session
        .warnings
        .iter()
        .any(|w| w.contains("temporarily unavailable")));
    assert_matches!(
        app.confirm(&buyer, &session.id, "no-rates").await,
        Err(ServiceError::ValidationError(_))
    );
    assert_eq!(order_count(&app).await, 0);

    shipping.restore();
    let session = app
        .services()
        .sessions
        .update_address(&session.id, &buyer, address())
        .await
        .unwrap();
    assert!(session.can_confirm);
    assert_eq!(session.selected_shipping.as_deref(), Some("standard"));
    assert!(session.shipping_amount > dec!(0));

    let confirmation = app.confirm(&buyer, &session.id, "rates-back").await.unwrap();
    let order = app.order(confirmation.order_id).await;
    assert_eq!(order.shipping_method.as_deref(), Some("standard"));
    assert_eq!(order.shipping_amount, session.shipping_amount);
}

#[tokio::test]
async fn second_shopper_loses_the_last_unit() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 1).await;
    let first = shopper();
    let second = shopper();

    let first_session = app.open_session(&first, &[(lamp, 1)], GATEWAY).await;
    let second_session = app.open_session(&second, &[(lamp, 1)], GATEWAY).await;

    app.confirm(&first, &first_session.id, "first").await.unwrap();
    let err = app
        .confirm(&second, &second_session.id, "second")
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::InsufficientStock { available: 0, requested: 1, .. }
    );
    assert_eq!(order_count(&app).await, 1);
    let level = app.stock(lamp).await;
    assert_eq!(level.quantity_reserved, 1);
    assert_eq!(level.available(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_never_oversell() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 3).await;

    let mut pending = Vec::new();
    for _ in 0..8 {
        let buyer = shopper();
        let session = app.open_session(&buyer, &[(lamp, 1)], GATEWAY).await;
        pending.push((buyer, session.id));
    }

    let mut tasks = Vec::new();
    for (buyer, session_id) in pending {
        let checkout = app.services().checkout.clone();
        tasks.push(tokio::spawn(async move {
            checkout
                .confirm_checkout(
                    &session_id,
                    &buyer,
                    &Uuid::new_v4().to_string(),
                    ConfirmCheckoutRequest::default(),
                )
                .await
        }));
    }

    let mut placed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => placed += 1,
            Err(err) => assert_matches!(err, ServiceError::InsufficientStock { .. }),
        }
    }

    assert_eq!(placed, 3);
    assert_eq!(order_count(&app).await, 3);
    assert_eq!(app.stock(lamp).await.quantity_reserved, 3);
}

#[tokio::test]
async fn session_without_payment_method_cannot_be_confirmed() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let session = app
        .services()
        .sessions
        .create(&buyer, session_request(&[(shirt, 1)]))
        .await
        .unwrap();
    assert!(!session.can_confirm);
    assert!(session.errors.iter().any(|e| e.contains("payment method")));

    let err = app.confirm(&buyer, &session.id, "no-method").await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let owner = shopper();
    let stranger = shopper();
    let session = app.open_session(&owner, &[(shirt, 1)], GATEWAY).await;

    assert_matches!(
        app.services().sessions.get(&session.id, &stranger).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        app.confirm(&stranger, &session.id, "steal").await,
        Err(ServiceError::NotFound(_))
    );
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn shortage_is_reported_on_the_session() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 2).await;
    let buyer = shopper();

    let session = app.open_session(&buyer, &[(shirt, 3)], GATEWAY).await;
    assert!(!session.can_confirm);
    assert_eq!(session.items[0].available_stock, 2);
    assert!(session.errors.iter().any(|e| e.contains("Only 2")));
}

#[tokio::test]
async fn discount_code_reduces_the_total() {
    let app = TestApp::new().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let session = app.open_session(&buyer, &[(shirt, 2)], GATEWAY).await;
    let session = app
        .services()
        .sessions
        .update_discount(&session.id, &buyer, Some(" welcome10 ".to_string()))
        .await
        .unwrap();
    assert_eq!(session.discount_code.as_deref(), Some("WELCOME10"));
    assert_eq!(session.discount_amount, dec!(50000));
    assert_eq!(session.total_amount, dec!(480000));

    let confirmation = app.confirm(&buyer, &session.id, "discounted").await.unwrap();
    let order = app.order(confirmation.order_id).await;
    assert_eq!(order.discount_amount, dec!(50000));
    assert_eq!(order.discount_code.as_deref(), Some("WELCOME10"));
    assert_eq!(order.total_amount, dec!(480000));
}

#[tokio::test]
async fn discount_outage_prices_without_discount() {
    let app = TestApp::builder()
        .discounts(Arc::new(UnreachableDiscounts))
        .build()
        .await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let mut request = session_request(&[(shirt, 2)]);
    request.discount_code = Some("WELCOME10".to_string());
    let session = app.services().sessions.create(&buyer, request).await.unwrap();
    let session = app
        .services()
        .sessions
        .update_payment_method(&session.id, &buyer, GATEWAY)
        .await
        .unwrap();

    assert_eq!(session.discount_amount, dec!(0));
    assert!(session.can_confirm);
    assert!(session
        .warnings
        .iter()
        .any(|w| w.contains("could not be verified")));

    let confirmation = app.confirm(&buyer, &session.id, "outage").await.unwrap();
    let order = app.order(confirmation.order_id).await;
    assert_eq!(order.discount_amount, dec!(0));
    assert!(order.discount_code.is_none());
    assert_eq!(order.total_amount, dec!(530000));
}

#[tokio::test]
async fn cart_is_cleared_after_checkout() {
    let cart = Arc::new(RecordingCart::default());
    let app = TestApp::builder().cart(cart.clone()).build().await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();
    let cart_id = Uuid::new_v4();

    let mut request = session_request(&[(shirt, 1)]);
    request.cart_id = Some(cart_id);
    let session = app.services().sessions.create(&buyer, request).await.unwrap();
    app.services()
        .sessions
        .update_payment_method(&session.id, &buyer, COD_METHOD)
        .await
        .unwrap();

    app.confirm(&buyer, &session.id, "cart").await.unwrap();
    assert_eq!(cart.cleared(), vec![cart_id]);
}

#[tokio::test]
async fn cart_failure_does_not_undo_the_order() {
    let app = TestApp::builder()
        .cart(Arc::new(RecordingCart::failing()))
        .build()
        .await;
    let shirt = app.seed_variant("Linen Shirt", dec!(250000), 5).await;
    let buyer = shopper();

    let mut request = session_request(&[(shirt, 1)]);
    request.cart_id = Some(Uuid::new_v4());
    let session = app.services().sessions.create(&buyer, request).await.unwrap();
    app.services()
        .sessions
        .update_payment_method(&session.id, &buyer, GATEWAY)
        .await
        .unwrap();

    let confirmation = app.confirm(&buyer, &session.id, "cart-down").await.unwrap();
    assert_eq!(app.order(confirmation.order_id).await.status, OrderStatus::Pending);
    assert_eq!(order_count(&app).await, 1);
}
