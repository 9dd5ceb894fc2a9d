use std::time::Duration;

use rust_decimal::Decimal;

use super::{CallbackParams, ParsedCallback, PaymentMethod, PaymentProvider, COD_METHOD};
use crate::entities::{order, payment};
use crate::errors::ServiceError;

/// Cash collected by the carrier. No redirect and no callback: the payment
/// is captured when the carrier reports delivery.
#[derive(Debug, Clone)]
pub struct CashOnDelivery {
    max_amount: Decimal,
    confirmation_base_url: String,
}

impl CashOnDelivery {
    pub fn new(max_amount: Decimal, confirmation_base_url: impl Into<String>) -> Self {
        Self {
            max_amount,
            confirmation_base_url: confirmation_base_url.into(),
        }
    }
}

impl PaymentProvider for CashOnDelivery {
    fn id(&self) -> &'static str {
        COD_METHOD
    }

    fn methods(&self) -> Vec<PaymentMethod> {
        vec![PaymentMethod {
            id: COD_METHOD.to_string(),
            name: "Cash on delivery".to_string(),
            provider: COD_METHOD.to_string(),
            redirect: false,
        }]
    }

    fn is_available(&self, total: Decimal) -> bool {
        total > Decimal::ZERO && total <= self.max_amount
    }

    fn payment_expiry(&self) -> Option<Duration> {
        None
    }

    fn payment_url(
        &self,
        order: &order::Model,
        _payment: &payment::Model,
        _method_id: &str,
    ) -> Result<String, ServiceError> {
        Ok(format!(
            "{}/{}",
            self.confirmation_base_url.trim_end_matches('/'),
            order.order_number
        ))
    }

    fn verify_callback(&self, _params: &CallbackParams) -> bool {
        false
    }

    fn parse_callback(&self, _params: &CallbackParams) -> Result<ParsedCallback, ServiceError> {
        Err(ServiceError::ValidationError(
            "Cash on delivery has no payment callbacks".to_string(),
        ))
    }
}
