//! Redis connection construction.

use redis::aio::ConnectionManager;
use tracing::info;

use smsgate_core::{GatewayError, GatewayResult};

/// Open a managed Redis connection. The manager reconnects on its own after
/// drops; callers clone it freely.
pub async fn connect_redis(url: &str) -> GatewayResult<ConnectionManager> {
    let client = redis::Client::open(url).map_err(GatewayError::cache)?;
    let manager = ConnectionManager::new(client)
        .await
        .map_err(GatewayError::cache)?;
    info!(url, "Redis connection established");
    Ok(manager)
}
