//! Periodic housekeeping for abandoned payments.
//!
//! One pass fails payments whose window closed, cancels PENDING orders left
//! with no payment that could still complete (which puts their stock back),
//! and drops expired idempotency records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::ServiceError;
use crate::services::{idempotency::IdempotencyGuard, orders::OrderService, payments::PaymentService};

const EXPIRY_REASON: &str = "Payment window expired";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub payments_expired: u64,
    pub orders_cancelled: u64,
    pub idempotency_records_removed: u64,
}

#[derive(Clone)]
pub struct PaymentExpirySweeper {
    payments: Arc<PaymentService>,
    orders: Arc<OrderService>,
    idempotency: Arc<IdempotencyGuard>,
    payment_window: Duration,
}

impl PaymentExpirySweeper {
    pub fn new(
        payments: Arc<PaymentService>,
        orders: Arc<OrderService>,
        idempotency: Arc<IdempotencyGuard>,
        payment_window: Duration,
    ) -> Self {
        Self {
            payments,
            orders,
            idempotency,
            payment_window,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport {
            payments_expired: self.payments.expire_overdue().await?,
            ..Default::default()
        };

        let window = chrono::Duration::from_std(self.payment_window)
            .map_err(|e| ServiceError::InternalError(format!("Invalid payment window: {}", e)))?;
        let cutoff = Utc::now() - window;

        for order in self.orders.stale_unpaid_orders(cutoff).await? {
            match self
                .orders
                .cancel_if_unpaid(order.id, Some(EXPIRY_REASON.to_string()))
                .await
            {
                Ok(Some(_)) => report.orders_cancelled += 1,
                Ok(None) => debug!(order_id = %order.id, "Payment reopened since the scan"),
                // Paid or cancelled by someone else since the scan.
                Err(ServiceError::InvalidStatus(_)) | Err(ServiceError::ConcurrentModification(_)) => {
                    debug!(order_id = %order.id, "Order moved on before expiry");
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Failed to cancel expired order");
                }
            }
        }

        report.idempotency_records_removed = self.idempotency.cleanup_expired().await?;

        if report.orders_cancelled > 0 {
            counter!("orders.expired", report.orders_cancelled);
        }
        if report != SweepReport::default() {
            info!(
                payments = report.payments_expired,
                orders = report.orders_cancelled,
                idempotency = report.idempotency_records_removed,
                "Payment expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs the sweep every `interval`. A zero interval disables it.
    pub fn spawn(self, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            info!("Payment expiry sweep disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("Payment expiry sweep failed: {}", e);
                }
            }
        }))
    }
}
