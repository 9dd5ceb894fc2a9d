use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Payload of the order confirmation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: Option<Uuid>,
    pub guest_id: Option<String>,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_url: String,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), ServiceError>;
}

/// Writes confirmations to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), ServiceError> {
        info!(
            order_id = %confirmation.order_id,
            order_number = %confirmation.order_number,
            total = %confirmation.total_amount,
            "Order confirmation sent"
        );
        Ok(())
    }
}
