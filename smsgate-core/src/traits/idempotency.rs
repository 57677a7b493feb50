use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;

/// Maps `(client, idempotency-key)` to the message a previous submission
/// created, with a bounded TTL. Lookups gate charging; stores are
/// best-effort.
#[async_trait]
pub trait IdempotencyGate: Send + Sync {
    /// The message id a prior request with this key produced, if any.
    async fn get(&self, client_id: Uuid, key: &str) -> GatewayResult<Option<Uuid>>;

    /// Remember `message_id` for this key. Does not overwrite an existing
    /// mapping.
    async fn put(&self, client_id: Uuid, key: &str, message_id: Uuid) -> GatewayResult<()>;
}
