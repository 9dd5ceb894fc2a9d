use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events emitted by the checkout pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),
    InventoryReserved {
        order_id: Uuid,
        variant_ids: Vec<Uuid>,
    },
    InventoryReleased(Uuid),
    PaymentCreated {
        order_id: Uuid,
        payment_id: Uuid,
        provider: String,
    },
    PaymentCaptured {
        order_id: Uuid,
        payment_id: Uuid,
    },
    PaymentFailed {
        order_id: Uuid,
        payment_id: Uuid,
    },
    CheckoutSessionCompleted(String),
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                total_amount,
            } => info!(%order_id, %order_number, %total_amount, "Order created"),
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "Order status changed"),
            other => info!("Received event: {:?}", other),
        }
    }

    info!("Event channel closed; event processing loop stopped");
}
