//! Postgres-backed message store.
//!
//! Every transition is a single conditional statement; ownership disputes
//! between workers resolve through affected-row counts, never through
//! read-then-write sequences.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use smsgate_core::{
    GatewayError, GatewayResult, Message, MessageStatus, MessageStore, NewMessage,
};

const COLUMNS: &str = "id, client_id, to_msisdn, from_sender, text, parts, status, \
     client_reference, provider, provider_message_id, attempts, last_error, express, \
     retry_after, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    client_id: Uuid,
    to_msisdn: String,
    from_sender: String,
    text: String,
    parts: i32,
    status: String,
    client_reference: Option<String>,
    provider: Option<String>,
    provider_message_id: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    express: bool,
    retry_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = GatewayError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let status = MessageStatus::from_str(&row.status)
            .map_err(|_| GatewayError::Other(format!("corrupt status column: {}", row.status)))?;
        Ok(Message {
            id: row.id,
            client_id: row.client_id,
            to: row.to_msisdn,
            from: row.from_sender,
            text: row.text,
            parts: row.parts.max(0) as u32,
            status,
            client_reference: row.client_reference,
            provider: row.provider,
            provider_message_id: row.provider_message_id,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            express: row.express,
            retry_after: row.retry_after,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `MessageStore` over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    /// Wrap the shared pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scan(
        &self,
        predicate_and_order: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE {predicate_and_order} LIMIT $2");
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        rows.into_iter().map(Message::try_from).collect()
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    #[instrument(skip(self, new), fields(msg_id = %new.id))]
    async fn create(&self, new: NewMessage) -> GatewayResult<Message> {
        let sql = format!(
            "INSERT INTO messages \
             (id, client_id, to_msisdn, from_sender, text, parts, status, client_reference, \
              attempts, express, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'QUEUED', $7, 0, $8, now(), now()) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(new.id)
            .bind(new.client_id)
            .bind(&new.to)
            .bind(&new.from)
            .bind(&new.text)
            .bind(new.parts as i32)
            .bind(&new.client_reference)
            .bind(new.express)
            .fetch_one(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        row.try_into()
    }

    async fn get(&self, id: Uuid) -> GatewayResult<Option<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE id = $1");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        row.map(Message::try_from).transpose()
    }

    async fn get_for_client(
        &self,
        id: Uuid,
        client_id: Uuid,
    ) -> GatewayResult<Option<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE id = $1 AND client_id = $2");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        row.map(Message::try_from).transpose()
    }

    async fn list_for_client(
        &self,
        client_id: Uuid,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE client_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(client_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn get_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> GatewayResult<Option<Message>> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE provider_message_id = $1");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        row.map(Message::try_from).transpose()
    }

    async fn delete(&self, id: Uuid) -> GatewayResult<()> {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        Ok(())
    }

    #[instrument(skip(self), fields(msg_id = %id))]
    async fn claim(&self, id: Uuid) -> GatewayResult<Option<Message>> {
        let sql = format!(
            "UPDATE messages \
             SET status = 'SENDING', attempts = attempts + 1, updated_at = now() \
             WHERE id = $1 AND status IN ('QUEUED', 'FAILED_TEMP') \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        row.map(Message::try_from).transpose()
    }

    async fn record_provider(&self, id: Uuid, provider: &str) -> GatewayResult<()> {
        sqlx::query("UPDATE messages SET provider = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(provider)
            .execute(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        Ok(())
    }

    #[instrument(skip(self), fields(msg_id = %id, status = %status))]
    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        provider_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> GatewayResult<()> {
        // Terminal rows admit only same-state repeats (plus provider-id
        // backfill); everything else flows through freely.
        let result = sqlx::query(
            "UPDATE messages SET status = $2, \
             provider_message_id = COALESCE($3, provider_message_id), \
             last_error = COALESCE($4, last_error), \
             updated_at = now() \
             WHERE id = $1 \
               AND (status NOT IN ('DELIVERED', 'FAILED_PERM', 'CANCELLED') OR status = $2)",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(provider_message_id)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::database)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current = sqlx::query("SELECT status FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::database)?;
        match current {
            None => Err(GatewayError::NotFound("message")),
            Some(row) => {
                let from = MessageStatus::from_str(row.get::<&str, _>("status"))
                    .unwrap_or(MessageStatus::Cancelled);
                Err(GatewayError::InvalidTransition { from, to: status })
            }
        }
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        last_error: &str,
    ) -> GatewayResult<()> {
        // SENDING rows come from the owning worker; SENT rows from a
        // failed_temp delivery receipt. Zero affected rows means the row
        // moved under us, which claim semantics make benign.
        sqlx::query(
            "UPDATE messages SET status = 'FAILED_TEMP', retry_after = $2, \
             last_error = $3, updated_at = now() \
             WHERE id = $1 AND status IN ('SENDING', 'SENT')",
        )
        .bind(id)
        .bind(retry_after)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::database)?;
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE messages SET status = 'QUEUED', updated_at = now() \
             WHERE id = $1 AND status = 'SENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::database)?;
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        self.scan(
            "status = 'FAILED_TEMP' AND retry_after IS NOT NULL AND retry_after <= $1 \
             ORDER BY updated_at ASC",
            now,
            limit,
        )
        .await
    }

    async fn stale_queued(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        self.scan(
            "status = 'QUEUED' AND created_at < $1 ORDER BY created_at ASC",
            older_than,
            limit,
        )
        .await
    }

    async fn stuck_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>> {
        self.scan(
            "status = 'SENDING' AND updated_at < $1 ORDER BY updated_at ASC",
            older_than,
            limit,
        )
        .await
    }
}
