//! Postgres-backed client store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use smsgate_core::{Client, ClientStore, GatewayError, GatewayResult};

const COLUMNS: &str = "id, name, api_key_hash, dlr_callback_url, callback_hmac_secret, \
     credit_cents, created_at";

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    name: String,
    api_key_hash: String,
    dlr_callback_url: Option<String>,
    callback_hmac_secret: Option<String>,
    credit_cents: i64,
    created_at: DateTime<Utc>,
}

impl From<ClientRow> for Client {
    fn from(row: ClientRow) -> Self {
        Client {
            id: row.id,
            name: row.name,
            api_key_hash: row.api_key_hash,
            dlr_callback_url: row.dlr_callback_url,
            callback_hmac_secret: row.callback_hmac_secret,
            credit_cents: row.credit_cents,
            created_at: row.created_at,
        }
    }
}

/// `ClientStore` over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgClientStore {
    pool: PgPool,
}

impl PgClientStore {
    /// Wrap the shared pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientStore for PgClientStore {
    #[instrument(skip_all)]
    async fn authenticate(&self, api_key: &str) -> GatewayResult<Option<Client>> {
        // Legacy seed rows store the key literally; match those first.
        let sql = format!("SELECT {COLUMNS} FROM clients WHERE api_key_hash = $1");
        let literal = sqlx::query_as::<_, ClientRow>(&sql)
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        if let Some(row) = literal {
            return Ok(Some(row.into()));
        }

        // bcrypt rows need a verify per candidate. The client table is small
        // by construction (tenants are provisioned by hand).
        let sql = format!("SELECT {COLUMNS} FROM clients WHERE api_key_hash LIKE '$2%'");
        let candidates = sqlx::query_as::<_, ClientRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(GatewayError::database)?;

        let key = api_key.to_owned();
        let matched = tokio::task::spawn_blocking(move || {
            candidates.into_iter().find(|row| {
                bcrypt::verify(&key, &row.api_key_hash).unwrap_or_else(|err| {
                    warn!(client_id = %row.id, error = %err, "Unverifiable api_key_hash");
                    false
                })
            })
        })
        .await
        .map_err(|e| GatewayError::Other(format!("bcrypt verify task failed: {e}")))?;

        Ok(matched.map(Into::into))
    }

    async fn get(&self, id: Uuid) -> GatewayResult<Option<Client>> {
        let sql = format!("SELECT {COLUMNS} FROM clients WHERE id = $1");
        let row = sqlx::query_as::<_, ClientRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(client_id = %id))]
    async fn topup(&self, id: Uuid, amount_cents: i64) -> GatewayResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE clients SET credit_cents = credit_cents + $2 WHERE id = $1 \
             RETURNING credit_cents",
        )
        .bind(id)
        .bind(amount_cents)
        .fetch_optional(&self.pool)
        .await
        .map_err(GatewayError::database)?;
        row.map(|(balance,)| balance)
            .ok_or(GatewayError::NotFound("client"))
    }
}
