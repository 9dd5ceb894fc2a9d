//! Collaborators the checkout pipeline consumes but does not own.
//!
//! Each one is a trait with a default implementation good enough to run the
//! service standalone. Calls into them are bounded by [`with_timeout`] and
//! never happen while an inventory row is locked.

pub mod cart;
pub mod catalog;
pub mod discounts;
pub mod notifications;
pub mod shipping;

pub use cart::{CartService, NoopCartService};
pub use catalog::{CatalogLookup, DbCatalog, VariantInfo};
pub use discounts::{DiscountEvaluation, DiscountEvaluator, StaticDiscountEvaluator};
pub use notifications::{LogNotificationSender, NotificationSender, OrderConfirmation};
pub use shipping::{Address, FlatRateShippingProvider, ShippingItem, ShippingOption, ShippingRateProvider};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::errors::ServiceError;

/// The set of collaborators wired into the checkout services.
#[derive(Clone)]
pub struct Integrations {
    pub catalog: Arc<dyn CatalogLookup>,
    pub discounts: Arc<dyn DiscountEvaluator>,
    pub shipping: Arc<dyn ShippingRateProvider>,
    pub cart: Arc<dyn CartService>,
    pub notifications: Arc<dyn NotificationSender>,
}

impl Integrations {
    /// Catalog read from the database, discount codes and shipping rates
    /// from configuration.
    pub fn from_config(db: Arc<DatabaseConnection>, config: &AppConfig) -> Self {
        Self {
            catalog: Arc::new(DbCatalog::new(db)),
            discounts: Arc::new(StaticDiscountEvaluator::new(config.discount_rules.clone())),
            shipping: Arc::new(FlatRateShippingProvider::new(config.shipping_rates.clone())),
            cart: Arc::new(NoopCartService),
            notifications: Arc::new(LogNotificationSender),
        }
    }
}

/// Bounds an external call; running out of time is a transient failure.
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(collaborator = what, ?timeout, "External call timed out");
            Err(ServiceError::TransientInfra(format!("{} timed out", what)))
        }
    }
}
