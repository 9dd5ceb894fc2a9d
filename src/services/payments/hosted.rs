//! Redirect gateway ("paygate").
//!
//! Outgoing and incoming parameters are signed the same way: every `pg_*`
//! parameter except the hash itself, sorted by name, form-urlencoded and
//! MACed with HMAC-SHA512 under the merchant secret. Amounts travel as
//! integers in hundredths of the currency unit.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::Sha512;
use url::{form_urlencoded, Url};
use uuid::Uuid;

use super::{CallbackParams, ParsedCallback, PaymentMethod, PaymentProvider};
use crate::config::AppConfig;
use crate::entities::{order, payment};
use crate::errors::ServiceError;

type HmacSha512 = Hmac<Sha512>;

pub const PROVIDER_ID: &str = "paygate";
const HASH_PARAM: &str = "pg_SecureHash";
const HASH_TYPE_PARAM: &str = "pg_SecureHashType";
const SUCCESS_CODE: &str = "00";

#[derive(Clone)]
pub struct HostedGateway {
    base_url: String,
    merchant_code: String,
    secret: String,
    return_url: String,
    currency: String,
    expiry: Duration,
}

impl HostedGateway {
    pub fn new(
        base_url: impl Into<String>,
        merchant_code: impl Into<String>,
        secret: impl Into<String>,
        return_url: impl Into<String>,
        currency: impl Into<String>,
        expiry: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            merchant_code: merchant_code.into(),
            secret: secret.into(),
            return_url: return_url.into(),
            currency: currency.into(),
            expiry,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.gateway_base_url.clone(),
            config.gateway_merchant_code.clone(),
            config.gateway_secret.clone(),
            config.gateway_return_url.clone(),
            config.currency.clone(),
            config.payment_expiry(),
        )
    }

    /// Hex HMAC over the canonical encoding of `params`.
    pub fn sign(&self, params: &CallbackParams) -> Result<String, ServiceError> {
        let mac = self.mac_for(params).ok_or_else(|| {
            ServiceError::InternalError("Gateway secret cannot key HMAC".to_string())
        })?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn mac_for(&self, params: &CallbackParams) -> Option<HmacSha512> {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(canonical_query(params).as_bytes());
        Some(mac)
    }
}

/// Sorted `name=value` pairs of the signed parameters.
pub fn canonical_query(params: &CallbackParams) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        if name.starts_with("pg_") && name != HASH_PARAM && name != HASH_TYPE_PARAM {
            serializer.append_pair(name, value);
        }
    }
    serializer.finish()
}

fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (amount * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("Amount {} is out of range", amount)))
}

impl PaymentProvider for HostedGateway {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn methods(&self) -> Vec<PaymentMethod> {
        vec![PaymentMethod {
            id: PROVIDER_ID.to_string(),
            name: "Card or bank transfer".to_string(),
            provider: PROVIDER_ID.to_string(),
            redirect: true,
        }]
    }

    fn is_available(&self, total: Decimal) -> bool {
        total > Decimal::ZERO
    }

    fn payment_expiry(&self) -> Option<Duration> {
        Some(self.expiry)
    }

    fn payment_url(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        _method_id: &str,
    ) -> Result<String, ServiceError> {
        let expires_at = payment
            .expires_at
            .unwrap_or_else(|| payment.created_at + chrono::Duration::minutes(15));

        let mut params = CallbackParams::new();
        params.insert("pg_Version".into(), "1".into());
        params.insert("pg_Command".into(), "pay".into());
        params.insert("pg_MerchantCode".into(), self.merchant_code.clone());
        params.insert("pg_Amount".into(), to_minor_units(payment.amount)?.to_string());
        params.insert("pg_CurrCode".into(), self.currency.clone());
        params.insert("pg_TxnRef".into(), payment.id.to_string());
        params.insert(
            "pg_OrderInfo".into(),
            format!("Payment for order {}", order.order_number),
        );
        params.insert("pg_ReturnUrl".into(), self.return_url.clone());
        params.insert(
            "pg_CreateDate".into(),
            payment.created_at.format("%Y%m%d%H%M%S").to_string(),
        );
        params.insert(
            "pg_ExpireDate".into(),
            expires_at.format("%Y%m%d%H%M%S").to_string(),
        );

        let signature = self.sign(&params)?;
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ServiceError::InternalError(format!("Invalid gateway base URL: {}", e))
        })?;
        url.set_query(Some(&canonical_query(&params)));
        url.query_pairs_mut().append_pair(HASH_PARAM, &signature);
        Ok(url.to_string())
    }

    fn verify_callback(&self, params: &CallbackParams) -> bool {
        let Some(provided) = params.get(HASH_PARAM) else {
            return false;
        };
        let Ok(provided) = hex::decode(provided.trim()) else {
            return false;
        };
        self.mac_for(params)
            .map(|mac| mac.verify_slice(&provided).is_ok())
            .unwrap_or(false)
    }

    fn parse_callback(&self, params: &CallbackParams) -> Result<ParsedCallback, ServiceError> {
        let field = |name: &str| {
            params
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| ServiceError::ValidationError(format!("Missing {}", name)))
        };

        let payment_id = Uuid::parse_str(field("pg_TxnRef")?)
            .map_err(|_| ServiceError::ValidationError("Malformed pg_TxnRef".to_string()))?;
        let minor: i64 = field("pg_Amount")?
            .parse()
            .map_err(|_| ServiceError::ValidationError("Malformed pg_Amount".to_string()))?;
        let success = field("pg_ResponseCode")? == SUCCESS_CODE
            && params
                .get("pg_TransactionStatus")
                .map(|status| status == SUCCESS_CODE)
                .unwrap_or(true);

        Ok(ParsedCallback {
            payment_id,
            amount: Decimal::new(minor, 2).normalize(),
            success,
            provider_txn_ref: params.get("pg_TransactionNo").cloned(),
        })
    }
}

/// Callback parameters signed the way the gateway signs them.
pub fn signed_callback(
    gateway: &HostedGateway,
    payment_id: Uuid,
    amount: Decimal,
    response_code: &str,
) -> Result<CallbackParams, ServiceError> {
    let mut params = CallbackParams::new();
    params.insert("pg_TxnRef".into(), payment_id.to_string());
    params.insert("pg_Amount".into(), to_minor_units(amount)?.to_string());
    params.insert("pg_ResponseCode".into(), response_code.to_string());
    params.insert("pg_TransactionStatus".into(), response_code.to_string());
    params.insert(
        "pg_TransactionNo".into(),
        format!("PG{}", Utc::now().timestamp_millis()),
    );
    params.insert("pg_MerchantCode".into(), gateway.merchant_code.clone());
    let signature = gateway.sign(&params)?;
    params.insert(HASH_PARAM.into(), signature);
    Ok(params)
}
