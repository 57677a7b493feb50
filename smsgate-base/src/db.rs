//! Postgres pool construction.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Ceiling on how long a pooled connection is reused before rotation.
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// How long an acquire may wait before surfacing a database timeout.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open the gateway's Postgres pool, sized from the host core count.
pub async fn connect_pg(url: &str) -> Result<PgPool, sqlx::Error> {
    let cores = num_cpus::get() as u32;
    let pool = PgPoolOptions::new()
        .max_connections(cores * 8)
        .min_connections(cores * 4)
        .max_lifetime(CONN_MAX_LIFETIME)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await?;
    info!(max = cores * 8, idle = cores * 4, "Postgres pool ready");
    Ok(pool)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../migrations").run(pool).await
}

/// Liveness probe used by `/readyz`.
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
