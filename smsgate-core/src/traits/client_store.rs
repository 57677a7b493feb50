use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::types::Client;

/// Read access to client rows plus the administrative balance top-up. All
/// other balance mutations go through the credit ledger.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Resolve an API key to its client. Keys are verified against the
    /// stored bcrypt hash; rows seeded with a literal key match by equality.
    async fn authenticate(&self, api_key: &str) -> GatewayResult<Option<Client>>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> GatewayResult<Option<Client>>;

    /// Add `amount_cents` to the client balance, returning the new balance.
    async fn topup(&self, id: Uuid, amount_cents: i64) -> GatewayResult<i64>;
}
