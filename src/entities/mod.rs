pub mod idempotency_key;
pub mod inventory_level;
pub mod inventory_reservation;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod product_variant;
