use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DiscountKind, DiscountRule};
use crate::errors::ServiceError;

/// Outcome of checking a discount code against a basket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountEvaluation {
    pub valid: bool,
    pub amount: Decimal,
    /// Human-readable description, or the reason the code was refused
    pub detail: String,
}

impl DiscountEvaluation {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            valid: false,
            amount: Decimal::ZERO,
            detail: detail.into(),
        }
    }
}

/// Line view handed to the discount evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub line_total: Decimal,
}

#[async_trait]
pub trait DiscountEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        code: &str,
        subtotal: Decimal,
        items: &[DiscountLine],
        user_id: Option<Uuid>,
    ) -> Result<DiscountEvaluation, ServiceError>;
}

/// Evaluates codes from a fixed rule list loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscountEvaluator {
    rules: Vec<DiscountRule>,
}

impl StaticDiscountEvaluator {
    pub fn new(rules: Vec<DiscountRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl DiscountEvaluator for StaticDiscountEvaluator {
    async fn evaluate(
        &self,
        code: &str,
        subtotal: Decimal,
        _items: &[DiscountLine],
        _user_id: Option<Uuid>,
    ) -> Result<DiscountEvaluation, ServiceError> {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.code.eq_ignore_ascii_case(code))
        else {
            return Ok(DiscountEvaluation::rejected(format!(
                "Discount code {} is not valid",
                code
            )));
        };

        if subtotal < rule.min_subtotal {
            return Ok(DiscountEvaluation::rejected(format!(
                "Discount code {} requires a subtotal of at least {}",
                rule.code, rule.min_subtotal
            )));
        }

        let amount = match rule.kind {
            DiscountKind::Percent => (subtotal * rule.value / Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            DiscountKind::Fixed => rule.value,
        };

        Ok(DiscountEvaluation {
            valid: true,
            amount,
            detail: rule.description.clone().unwrap_or_else(|| match rule.kind {
                DiscountKind::Percent => format!("{}% off", rule.value.normalize()),
                DiscountKind::Fixed => format!("{} off", rule.value.normalize()),
            }),
        })
    }
}
