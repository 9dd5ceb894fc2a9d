// Storage-level guarantees
pub mod idempotency;
pub mod inventory;

// Order lifecycle
pub mod order_status;
pub mod orders;

// Payments and the background sweep that expires them
pub mod payment_expiry;
pub mod payments;

// Checkout sessions and confirmation
pub mod commerce;
