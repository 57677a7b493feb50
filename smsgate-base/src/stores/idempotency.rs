//! Redis-backed idempotency gate.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use smsgate_core::{GatewayError, GatewayResult, IdempotencyGate};

/// How long a key shields against replays.
const TTL_SECONDS: u64 = 24 * 60 * 60;

/// `IdempotencyGate` over Redis.
#[derive(Clone)]
pub struct RedisIdempotencyGate {
    conn: ConnectionManager,
}

impl RedisIdempotencyGate {
    /// Wrap the shared connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn storage_key(client_id: Uuid, key: &str) -> String {
        format!("idempotency:{client_id}:{key}")
    }
}

#[async_trait]
impl IdempotencyGate for RedisIdempotencyGate {
    async fn get(&self, client_id: Uuid, key: &str) -> GatewayResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::storage_key(client_id, key))
            .query_async(&mut conn)
            .await
            .map_err(GatewayError::cache)?;
        match value {
            None => Ok(None),
            Some(raw) => match Uuid::parse_str(&raw) {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    warn!(client_id = %client_id, "Discarding corrupt idempotency value");
                    Ok(None)
                }
            },
        }
    }

    async fn put(&self, client_id: Uuid, key: &str, message_id: Uuid) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        // NX keeps the first writer's mapping if two requests race.
        let _: Option<String> = redis::cmd("SET")
            .arg(Self::storage_key(client_id, key))
            .arg(message_id.to_string())
            .arg("NX")
            .arg("EX")
            .arg(TTL_SECONDS)
            .query_async(&mut conn)
            .await
            .map_err(GatewayError::cache)?;
        Ok(())
    }
}
