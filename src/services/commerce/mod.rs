//! Checkout: sessions, pricing and turning a session into an order.
pub mod checkout_service;
pub mod checkout_session_service;
pub mod pricing_service;

pub use checkout_service::{CheckoutConfirmation, CheckoutService, ConfirmCheckoutRequest};
pub use checkout_session_service::{CheckoutSession, CheckoutSessionService, CreateSessionRequest};
pub use pricing_service::{PriceQuote, PricingService};
