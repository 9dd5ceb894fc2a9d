//! Order lifecycle rules.
//!
//! ```text
//! PENDING -> CONFIRMED -> PROCESSING -> SHIPPED -> DELIVERED
//!    |           |                                   |   \
//!    +-----------+--> CANCELLED             RETURNED --> REFUNDED
//! ```

use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;

/// Forward chain walked by fulfillment events.
pub const FULFILLMENT_CHAIN: [OrderStatus; 5] = [
    OrderStatus::Pending,
    OrderStatus::Confirmed,
    OrderStatus::Processing,
    OrderStatus::Shipped,
    OrderStatus::Delivered,
];

/// Statuses `from` may move to directly.
pub fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[Processing, Cancelled],
        Processing => &[Shipped],
        Shipped => &[Delivered],
        Delivered => &[Returned, Refunded],
        Returned => &[Refunded],
        Cancelled | Refunded => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

pub fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), ServiceError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(ServiceError::InvalidStatus(format!(
            "Cannot move order from {} to {}",
            status_label(from),
            status_label(to)
        )))
    }
}

pub fn is_terminal(status: OrderStatus) -> bool {
    allowed_transitions(status).is_empty()
}

/// Position on the fulfillment chain, `None` for side branches.
pub fn chain_position(status: OrderStatus) -> Option<usize> {
    FULFILLMENT_CHAIN.iter().position(|s| *s == status)
}

/// Intermediate steps needed to walk from `from` up to `to` along the
/// fulfillment chain, `to` included. Empty when `to` is not ahead of `from`.
pub fn forward_path(from: OrderStatus, to: OrderStatus) -> Vec<OrderStatus> {
    match (chain_position(from), chain_position(to)) {
        (Some(start), Some(end)) if end > start => FULFILLMENT_CHAIN[start + 1..=end].to_vec(),
        _ => Vec::new(),
    }
}

pub fn status_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "PENDING",
        OrderStatus::Confirmed => "CONFIRMED",
        OrderStatus::Processing => "PROCESSING",
        OrderStatus::Shipped => "SHIPPED",
        OrderStatus::Delivered => "DELIVERED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Returned => "RETURNED",
        OrderStatus::Refunded => "REFUNDED",
    }
}
