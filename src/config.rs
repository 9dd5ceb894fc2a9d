use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CACHE_TYPE: &str = "in-memory";
const DEFAULT_CURRENCY: &str = "VND";
const DEFAULT_CHECKOUT_SESSION_TTL_SECS: u64 = 1800;
const DEFAULT_PAYMENT_EXPIRY_SECS: u64 = 900;
const DEFAULT_COD_MAX_AMOUNT: i64 = 5_000_000;
const DEFAULT_EXTERNAL_CALL_TIMEOUT_SECS: u64 = 5;
const DEFAULT_INVENTORY_LOCK_RETRIES: u32 = 3;
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 86_400;
const DEFAULT_IDEMPOTENCY_PROCESSING_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PAYMENT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEV_GATEWAY_SECRET: &str = "dev-gateway-secret-change-me";

/// Discount kinds understood by the built-in discount evaluator
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percent,
    Fixed,
}

/// A statically configured discount code
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscountRule {
    pub code: String,
    pub kind: DiscountKind,
    pub value: Decimal,
    #[serde(default)]
    pub min_subtotal: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

/// Flat shipping rates used by the built-in rate provider
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShippingRates {
    #[serde(default = "default_standard_rate")]
    pub standard: Decimal,
    #[serde(default = "default_express_rate")]
    pub express: Decimal,
    /// Orders at or above this subtotal ship standard for free
    #[serde(default)]
    pub free_standard_over: Option<Decimal>,
    /// Heaviest parcel express will take, in grams
    #[serde(default = "default_express_max_weight")]
    pub express_max_weight_grams: i32,
}

impl Default for ShippingRates {
    fn default() -> Self {
        Self {
            standard: default_standard_rate(),
            express: default_express_rate(),
            free_standard_over: None,
            express_max_weight_grams: default_express_max_weight(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Checkout session store: "in-memory" or "redis"
    #[serde(default = "default_cache_type")]
    #[validate(custom = "validate_cache_type")]
    pub cache_type: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel buffer
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// ISO currency code stamped on orders
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Lifetime of a checkout session, fixed at creation
    #[serde(default = "default_checkout_session_ttl_secs")]
    #[validate(range(min = 60))]
    pub checkout_session_ttl_secs: u64,

    /// Window a pending online payment stays payable
    #[serde(default = "default_payment_expiry_secs")]
    #[validate(range(min = 60))]
    pub payment_expiry_secs: u64,

    /// Cash on delivery is offered only up to this total
    #[serde(default = "default_cod_max_amount")]
    pub cod_max_amount: Decimal,

    /// Hosted payment page of the redirect gateway
    #[serde(default = "default_gateway_base_url")]
    #[validate(url)]
    pub gateway_base_url: String,

    #[serde(default = "default_gateway_merchant_code")]
    pub gateway_merchant_code: String,

    /// Shared secret used to sign and verify gateway parameters
    #[serde(default = "default_gateway_secret")]
    #[validate(length(min = 16))]
    pub gateway_secret: String,

    /// Where the gateway sends the shopper back after paying
    #[serde(default = "default_gateway_return_url")]
    #[validate(url)]
    pub gateway_return_url: String,

    /// Base of the order confirmation page (used for COD orders)
    #[serde(default = "default_order_confirmation_base_url")]
    #[validate(url)]
    pub order_confirmation_base_url: String,

    /// When set, carrier webhooks must carry a valid HMAC signature
    #[serde(default)]
    pub carrier_webhook_secret: Option<String>,

    /// Bound on every call to an external collaborator
    #[serde(default = "default_external_call_timeout_secs")]
    #[validate(range(min = 1, max = 9))]
    pub external_call_timeout_secs: u64,

    /// Attempts made when an inventory lock times out or deadlocks
    #[serde(default = "default_inventory_lock_retries")]
    #[validate(range(min = 1, max = 10))]
    pub inventory_lock_retries: u32,

    /// Retention of completed idempotency records
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// A PROCESSING record older than this is treated as abandoned
    #[serde(default = "default_idempotency_processing_timeout_secs")]
    #[validate(range(min = 1))]
    pub idempotency_processing_timeout_secs: u64,

    /// How often the payment-expiry sweep runs; 0 disables it
    #[serde(default = "default_payment_sweep_interval_secs")]
    pub payment_sweep_interval_secs: u64,

    /// Built-in discount codes
    #[serde(default)]
    pub discount_rules: Vec<DiscountRule>,

    /// Built-in shipping rates
    #[serde(default)]
    pub shipping_rates: ShippingRates,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the
    /// connection settings and environment.
    pub fn new(
        database_url: String,
        redis_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url,
            cache_type: default_cache_type(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            currency: default_currency(),
            checkout_session_ttl_secs: default_checkout_session_ttl_secs(),
            payment_expiry_secs: default_payment_expiry_secs(),
            cod_max_amount: default_cod_max_amount(),
            gateway_base_url: default_gateway_base_url(),
            gateway_merchant_code: default_gateway_merchant_code(),
            gateway_secret: default_gateway_secret(),
            gateway_return_url: default_gateway_return_url(),
            order_confirmation_base_url: default_order_confirmation_base_url(),
            carrier_webhook_secret: None,
            external_call_timeout_secs: default_external_call_timeout_secs(),
            inventory_lock_retries: default_inventory_lock_retries(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            idempotency_processing_timeout_secs: default_idempotency_processing_timeout_secs(),
            payment_sweep_interval_secs: default_payment_sweep_interval_secs(),
            discount_rules: Vec::new(),
            shipping_rates: ShippingRates::default(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn checkout_session_ttl(&self) -> Duration {
        Duration::from_secs(self.checkout_session_ttl_secs)
    }

    pub fn payment_expiry(&self) -> Duration {
        Duration::from_secs(self.payment_expiry_secs)
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn idempotency_processing_timeout(&self) -> Duration {
        Duration::from_secs(self.idempotency_processing_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.gateway_secret.trim() == DEV_GATEWAY_SECRET {
            let mut err = ValidationError::new("gateway_secret_default_dev");
            err.message = Some(
                "The bundled development gateway secret must not be used outside development. Set APP__GATEWAY_SECRET."
                    .into(),
            );
            errors.add("gateway_secret", err);
        }

        if self.cod_max_amount.is_sign_negative() {
            let mut err = ValidationError::new("cod_max_amount");
            err.message = Some("cod_max_amount must not be negative".into());
            errors.add("cod_max_amount", err);
        }

        for rule in &self.discount_rules {
            let out_of_range = match rule.kind {
                DiscountKind::Percent => {
                    rule.value <= Decimal::ZERO || rule.value > Decimal::ONE_HUNDRED
                }
                DiscountKind::Fixed => rule.value <= Decimal::ZERO,
            };
            if out_of_range || rule.code.trim().is_empty() {
                let mut err = ValidationError::new("discount_rules");
                err.message = Some(format!("invalid discount rule '{}'", rule.code).into());
                errors.add("discount_rules", err);
            }
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cache_type() -> String {
    DEFAULT_CACHE_TYPE.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    5
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_checkout_session_ttl_secs() -> u64 {
    DEFAULT_CHECKOUT_SESSION_TTL_SECS
}

fn default_payment_expiry_secs() -> u64 {
    DEFAULT_PAYMENT_EXPIRY_SECS
}

fn default_cod_max_amount() -> Decimal {
    Decimal::from(DEFAULT_COD_MAX_AMOUNT)
}

fn default_gateway_base_url() -> String {
    "https://sandbox.paygate.example/pay".to_string()
}

fn default_gateway_merchant_code() -> String {
    "DEVMERCHANT".to_string()
}

fn default_gateway_secret() -> String {
    DEV_GATEWAY_SECRET.to_string()
}

fn default_gateway_return_url() -> String {
    "http://localhost:3000/checkout/payment-return".to_string()
}

fn default_order_confirmation_base_url() -> String {
    "http://localhost:3000/orders".to_string()
}

fn default_external_call_timeout_secs() -> u64 {
    DEFAULT_EXTERNAL_CALL_TIMEOUT_SECS
}

fn default_inventory_lock_retries() -> u32 {
    DEFAULT_INVENTORY_LOCK_RETRIES
}

fn default_idempotency_ttl_secs() -> u64 {
    DEFAULT_IDEMPOTENCY_TTL_SECS
}

fn default_idempotency_processing_timeout_secs() -> u64 {
    DEFAULT_IDEMPOTENCY_PROCESSING_TIMEOUT_SECS
}

fn default_payment_sweep_interval_secs() -> u64 {
    DEFAULT_PAYMENT_SWEEP_INTERVAL_SECS
}

fn default_standard_rate() -> Decimal {
    Decimal::from(30_000)
}

fn default_express_rate() -> Decimal {
    Decimal::from(60_000)
}

fn default_express_max_weight() -> i32 {
    20_000
}

fn validate_cache_type(value: &str) -> Result<(), ValidationError> {
    match value {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("cache_type");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("order_fulfillment={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://orders.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", 8080)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
