mod common;

use assert_matches::assert_matches;
use common::{shopper, TestApp};
use order_fulfillment::{
    auth::Identity,
    entities::{
        inventory_reservation::ReservationStatus, order::OrderStatus, payment::PaymentStatus,
    },
    errors::ServiceError,
    services::{
        orders::{transition_in, CarrierStatus},
        payments::COD_METHOD,
    },
};
use rust_decimal_macros::dec;

const GATEWAY: &str = "paygate";

#[tokio::test]
async fn carrier_events_walk_a_cod_order_to_delivery() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 2)], COD_METHOD).await;
    let number = confirmation.order_number.as_str();

    let picked = app.carrier(number, CarrierStatus::ReadyToPick).await.unwrap();
    assert!(picked.changed);
    assert_eq!(picked.status, OrderStatus::Processing);

    let shipped = app.carrier(number, CarrierStatus::InTransit).await.unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert_eq!(
        app.order(confirmation.order_id).await.tracking_number.as_deref(),
        Some("TRACK-1")
    );

    let delivered = app.carrier(number, CarrierStatus::Delivered).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);

    let level = app.stock(lamp).await;
    assert_eq!(level.quantity_on_hand, 3);
    assert_eq!(level.quantity_reserved, 0);

    let order = app.order(confirmation.order_id).await;
    assert!(order.paid_at.is_some(), "cash collected on delivery pays the order");
    let payments = app.payments_of(confirmation.order_id).await;
    assert_eq!(payments[0].status, PaymentStatus::Captured);

    let reservations = app
        .services()
        .inventory
        .reservations_for(confirmation.order_id)
        .await
        .unwrap();
    assert!(reservations.iter().all(|r| r.status == ReservationStatus::Sold));
}

#[tokio::test]
async fn skipped_carrier_steps_are_filled_in() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], GATEWAY).await;
    app.pay(&confirmation).await;

    let outcome = app
        .carrier(&confirmation.order_number, CarrierStatus::Delivered)
        .await
        .unwrap();

    assert!(outcome.changed);
    assert_eq!(outcome.status, OrderStatus::Delivered);
    // CONFIRMED -> PROCESSING -> SHIPPED -> DELIVERED, one version each
    assert_eq!(app.order(confirmation.order_id).await.version, 5);
}

#[tokio::test]
async fn stale_carrier_event_is_ignored() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], COD_METHOD).await;
    let number = confirmation.order_number.as_str();

    app.carrier(number, CarrierStatus::InTransit).await.unwrap();
    let before = app.order(confirmation.order_id).await;

    let late = app.carrier(number, CarrierStatus::PickedUp).await.unwrap();
    assert!(!late.changed);
    assert_eq!(late.status, OrderStatus::Shipped);
    let repeat = app.carrier(number, CarrierStatus::ReadyToPick).await.unwrap();
    assert!(!repeat.changed);

    assert_eq!(app.order(confirmation.order_id).await.version, before.version);
}

#[tokio::test]
async fn carrier_cannot_move_unpaid_or_cancelled_orders() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let unpaid = app.place_order(&shopper(), &[(lamp, 1)], GATEWAY).await;

    assert_matches!(
        app.carrier(&unpaid.order_number, CarrierStatus::InTransit).await,
        Err(ServiceError::InvalidStatus(_))
    );

    app.services().orders.cancel(unpaid.order_id, None).await.unwrap();
    assert_matches!(
        app.carrier(&unpaid.order_number, CarrierStatus::Delivered).await,
        Err(ServiceError::InvalidStatus(_))
    );
    assert_matches!(
        app.carrier("ORD-00000000-NOPE00", CarrierStatus::Delivered).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn returned_goods_go_back_on_the_shelf() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 2)], COD_METHOD).await;
    app.carrier(&confirmation.order_number, CarrierStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(app.stock(lamp).await.quantity_on_hand, 3);

    let orders = &app.services().orders;
    let returned = orders.request_return(confirmation.order_id).await.unwrap();
    assert_eq!(returned.status, OrderStatus::Returned);

    let level = app.stock(lamp).await;
    assert_eq!(level.quantity_on_hand, 5);
    assert_eq!(level.quantity_reserved, 0);
    assert_eq!(level.available(), 5);

    let refunded = orders.refund(confirmation.order_id).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_matches!(
        orders.refund(confirmation.order_id).await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn carrier_return_restocks_a_delivered_order() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 4).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], COD_METHOD).await;
    let number = confirmation.order_number.as_str();

    assert_matches!(
        app.carrier(number, CarrierStatus::Returned).await,
        Err(ServiceError::InvalidStatus(_))
    );

    app.carrier(number, CarrierStatus::Delivered).await.unwrap();
    let outcome = app.carrier(number, CarrierStatus::Returned).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.status, OrderStatus::Returned);
    assert_eq!(app.stock(lamp).await.quantity_on_hand, 4);

    let again = app.carrier(number, CarrierStatus::Returned).await.unwrap();
    assert!(!again.changed);
}

#[tokio::test]
async fn delivered_order_can_be_refunded_without_a_return() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 4).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], COD_METHOD).await;
    app.carrier(&confirmation.order_number, CarrierStatus::Delivered)
        .await
        .unwrap();

    let refunded = app
        .services()
        .orders
        .refund(confirmation.order_id)
        .await
        .unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    // Goods never came back
    assert_eq!(app.stock(lamp).await.quantity_on_hand, 3);
}

#[tokio::test]
async fn cancel_releases_stock_and_fails_the_payment() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 3)], GATEWAY).await;
    assert_eq!(app.stock(lamp).await.available(), 2);

    let orders = &app.services().orders;
    let cancelled = orders
        .cancel(confirmation.order_id, Some("ordered twice".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(cancelled.notes.as_deref(), Some("ordered twice"));

    assert_eq!(app.stock(lamp).await.available(), 5);
    assert_eq!(
        app.payments_of(confirmation.order_id).await[0].status,
        PaymentStatus::Failed
    );
    assert_matches!(
        orders.cancel(confirmation.order_id, None).await,
        Err(ServiceError::InvalidStatus(_))
    );
}

#[tokio::test]
async fn shipped_order_cannot_be_cancelled() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], COD_METHOD).await;
    app.carrier(&confirmation.order_number, CarrierStatus::PickedUp)
        .await
        .unwrap();

    assert_matches!(
        app.services().orders.cancel(confirmation.order_id, None).await,
        Err(ServiceError::InvalidStatus(_))
    );
    assert_eq!(app.stock(lamp).await.quantity_reserved, 1);
}

#[tokio::test]
async fn stale_version_write_is_rejected() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], GATEWAY).await;
    let stale = app.order(confirmation.order_id).await;

    app.services()
        .orders
        .cancel(confirmation.order_id, None)
        .await
        .unwrap();

    let err = transition_in(
        &*app.state.db,
        &stale,
        OrderStatus::Confirmed,
        Default::default(),
    )
    .await
    .unwrap_err();
    assert_matches!(err, ServiceError::ConcurrentModification(id) if id == stale.id);
    assert_eq!(
        app.order(confirmation.order_id).await.status,
        OrderStatus::Cancelled
    );
}

#[tokio::test]
async fn guest_orders_follow_the_shopper_into_their_account() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let guest = Identity::guest("guest-42");
    let first = app.place_order(&guest, &[(lamp, 1)], COD_METHOD).await;
    let second = app.place_order(&guest, &[(lamp, 1)], GATEWAY).await;
    let other = app
        .place_order(&Identity::guest("guest-7"), &[(lamp, 1)], COD_METHOD)
        .await;

    let account = shopper();
    let user_id = account.user_id.unwrap();
    let merged = app
        .services()
        .orders
        .merge_guest_orders("guest-42", user_id)
        .await
        .unwrap();
    assert_eq!(merged, 2);

    for id in [first.order_id, second.order_id] {
        let order = app.order(id).await;
        assert_eq!(order.user_id, Some(user_id));
        assert!(order.guest_id.is_none());
        assert!(account.can_access(order.user_id, order.guest_id.as_deref()));
        assert!(!guest.can_access(order.user_id, order.guest_id.as_deref()));
    }
    assert_eq!(
        app.order(other.order_id).await.guest_id.as_deref(),
        Some("guest-7")
    );

    assert_matches!(
        app.services().orders.merge_guest_orders("  ", user_id).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn orders_can_be_found_by_number() {
    let app = TestApp::new().await;
    let lamp = app.seed_variant("Desk Lamp", dec!(400000), 5).await;
    let confirmation = app.place_order(&shopper(), &[(lamp, 1)], GATEWAY).await;

    let found = app
        .services()
        .orders
        .find_by_number(&confirmation.order_number)
        .await
        .unwrap();
    assert_eq!(found.id, confirmation.order_id);
    assert!(found.order_number.starts_with("ORD-"));
    assert_matches!(
        app.services().orders.find_by_number("ORD-MISSING").await,
        Err(ServiceError::NotFound(_))
    );
}
