use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::config::ShippingRates;
use crate::errors::ServiceError;

/// Delivery address captured during checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct Address {
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[validate(length(min = 6, max = 20))]
    pub phone: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[validate(length(equal = 2))]
    pub country: String,
}

/// Parcel content used to rate a shipment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingItem {
    pub variant_id: Uuid,
    pub quantity: i32,
    pub weight_grams: i32,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ShippingOption {
    pub id: String,
    pub carrier: String,
    pub amount: Decimal,
    pub eta_days: u32,
    pub available: bool,
}

#[async_trait]
pub trait ShippingRateProvider: Send + Sync {
    async fn quote(
        &self,
        address: &Address,
        items: &[ShippingItem],
    ) -> Result<Vec<ShippingOption>, ServiceError>;
}

/// Standard and express rates from configuration. Express is refused for
/// parcels over its weight limit.
#[derive(Debug, Clone, Default)]
pub struct FlatRateShippingProvider {
    rates: ShippingRates,
}

impl FlatRateShippingProvider {
    pub fn new(rates: ShippingRates) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl ShippingRateProvider for FlatRateShippingProvider {
    async fn quote(
        &self,
        _address: &Address,
        items: &[ShippingItem],
    ) -> Result<Vec<ShippingOption>, ServiceError> {
        let weight: i64 = items
            .iter()
            .map(|item| i64::from(item.weight_grams) * i64::from(item.quantity))
            .sum();
        let subtotal: Decimal = items.iter().map(|item| item.line_total).sum();

        let standard = match self.rates.free_standard_over {
            Some(threshold) if subtotal >= threshold => Decimal::ZERO,
            _ => self.rates.standard,
        };

        Ok(vec![
            ShippingOption {
                id: "standard".to_string(),
                carrier: "ground".to_string(),
                amount: standard,
                eta_days: 4,
                available: true,
            },
            ShippingOption {
                id: "express".to_string(),
                carrier: "air".to_string(),
                amount: self.rates.express,
                eta_days: 1,
                available: weight <= i64::from(self.rates.express_max_weight_grams),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn address() -> Address {
        Address {
            recipient_name: "Lan Tran".into(),
            phone: "0901234567".into(),
            line1: "12 Nguyen Hue".into(),
            line2: None,
            city: "Ho Chi Minh City".into(),
            province: None,
            postal_code: None,
            country: "VN".into(),
        }
    }

    fn item(weight_grams: i32, quantity: i32, line_total: Decimal) -> ShippingItem {
        ShippingItem {
            variant_id: Uuid::new_v4(),
            quantity,
            weight_grams,
            line_total,
        }
    }

    #[tokio::test]
    async fn heavy_parcels_cannot_go_express() {
        let provider = FlatRateShippingProvider::default();
        let options = provider
            .quote(&address(), &[item(7_000, 3, dec!(300000))])
            .await
            .unwrap();
        let express = options.iter().find(|o| o.id == "express").unwrap();
        assert!(!express.available);
        assert!(options.iter().find(|o| o.id == "standard").unwrap().available);
    }

    #[tokio::test]
    async fn standard_is_free_over_threshold() {
        let provider = FlatRateShippingProvider::new(ShippingRates {
            free_standard_over: Some(dec!(1000000)),
            ..ShippingRates::default()
        });
        let options = provider
            .quote(&address(), &[item(500, 1, dec!(1200000))])
            .await
            .unwrap();
        assert_eq!(options[0].amount, Decimal::ZERO);
    }
}
