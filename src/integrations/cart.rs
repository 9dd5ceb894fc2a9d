use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Shopping cart owned by another service; checkout only empties it.
#[async_trait]
pub trait CartService: Send + Sync {
    async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError>;
}

/// Used when no cart service is wired in.
#[derive(Debug, Clone, Default)]
pub struct NoopCartService;

#[async_trait]
impl CartService for NoopCartService {
    async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        info!(%cart_id, "Cart cleared after checkout");
        Ok(())
    }
}
