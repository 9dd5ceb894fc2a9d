use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::integrations::{discounts::DiscountLine, with_timeout, DiscountEvaluator};

/// Line priced at the unit price captured when it entered the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricingLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PriceQuote {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    /// Description of the applied discount, or why the code was refused
    pub discount_detail: Option<String>,
    pub discount_applied: bool,
}

impl PriceQuote {
    pub fn total_with_shipping(&self, shipping: Decimal) -> Decimal {
        self.subtotal - self.discount_amount + shipping
    }
}

pub fn subtotal(lines: &[PricingLine]) -> Decimal {
    lines.iter().map(PricingLine::line_total).sum()
}

/// A discount never goes below zero nor beyond the subtotal.
pub fn clamp_discount(amount: Decimal, subtotal: Decimal) -> Decimal {
    amount.max(Decimal::ZERO).min(subtotal.max(Decimal::ZERO))
}

#[derive(Clone)]
pub struct PricingService {
    discounts: Arc<dyn DiscountEvaluator>,
    timeout: Duration,
}

impl PricingService {
    pub fn new(discounts: Arc<dyn DiscountEvaluator>, timeout: Duration) -> Self {
        Self { discounts, timeout }
    }

    /// Prices `lines`. A bad or unverifiable discount code only zeroes the
    /// discount; pricing itself never fails.
    pub async fn price(
        &self,
        lines: &[PricingLine],
        discount_code: Option<&str>,
        user_id: Option<Uuid>,
    ) -> PriceQuote {
        let subtotal = subtotal(lines);
        let code = discount_code.map(str::trim).filter(|code| !code.is_empty());

        let Some(code) = code else {
            return PriceQuote {
                subtotal,
                discount_amount: Decimal::ZERO,
                discount_detail: None,
                discount_applied: false,
            };
        };

        let discount_lines: Vec<DiscountLine> = lines
            .iter()
            .map(|line| DiscountLine {
                variant_id: line.variant_id,
                product_id: line.product_id,
                quantity: line.quantity,
                line_total: line.line_total(),
            })
            .collect();

        let evaluation = with_timeout(
            self.timeout,
            "discount evaluator",
            self.discounts
                .evaluate(code, subtotal, &discount_lines, user_id),
        )
        .await;

        match evaluation {
            Ok(evaluation) if evaluation.valid => {
                let amount = clamp_discount(evaluation.amount, subtotal);
                debug!(%amount, "Discount applied");
                PriceQuote {
                    subtotal,
                    discount_amount: amount,
                    discount_detail: Some(evaluation.detail),
                    discount_applied: true,
                }
            }
            Ok(evaluation) => PriceQuote {
                subtotal,
                discount_amount: Decimal::ZERO,
                discount_detail: Some(evaluation.detail),
                discount_applied: false,
            },
            Err(e) => {
                warn!(error = %e, "Discount evaluation failed; pricing without discount");
                PriceQuote {
                    subtotal,
                    discount_amount: Decimal::ZERO,
                    discount_detail: Some(
                        "Discount could not be verified right now; please try again".to_string(),
                    ),
                    discount_applied: false,
                }
            }
        }
    }
}
