use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::types::{Message, MessageStatus, NewMessage};

/// Typed CRUD and state transitions over the `messages` table.
///
/// All transition methods are single conditional statements on the store
/// side, which is what makes redelivered jobs and racing workers harmless.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a fresh row with `status = QUEUED` and `attempts = 0`.
    async fn create(&self, new: NewMessage) -> GatewayResult<Message>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> GatewayResult<Option<Message>>;

    /// Fetch by id, scoped to the owning client.
    async fn get_for_client(&self, id: Uuid, client_id: Uuid)
        -> GatewayResult<Option<Message>>;

    /// Most recent messages of a client, newest first.
    async fn list_for_client(&self, client_id: Uuid, limit: u32)
        -> GatewayResult<Vec<Message>>;

    /// Resolve a delivery receipt to its message.
    async fn get_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> GatewayResult<Option<Message>>;

    /// Remove a row. Only the intake unwind path uses this.
    async fn delete(&self, id: Uuid) -> GatewayResult<()>;

    /// Atomically move `QUEUED | FAILED_TEMP -> SENDING` and increment the
    /// attempt counter, returning the claimed row. `None` means another
    /// worker owns the message or it reached a terminal state; the caller
    /// drops the job silently.
    async fn claim(&self, id: Uuid) -> GatewayResult<Option<Message>>;

    /// Record which provider is handling the current attempt.
    async fn record_provider(&self, id: Uuid, provider: &str) -> GatewayResult<()>;

    /// Generic transition. Fails with `InvalidTransition` when the row is
    /// already terminal in a different state; callers treat that as a no-op
    /// signal, not a fault. `provider_message_id` backfills are applied even
    /// on terminal rows.
    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        provider_message_id: Option<&str>,
        last_error: Option<&str>,
    ) -> GatewayResult<()>;

    /// Move a `SENDING` or `SENT` row to `FAILED_TEMP` with the time before
    /// which no retry may run. `SENT` rows arrive here via failed_temp
    /// delivery receipts.
    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_after: DateTime<Utc>,
        last_error: &str,
    ) -> GatewayResult<()>;

    /// Unconditionally put a stuck `SENDING` row back to `QUEUED`. Racing an
    /// alive worker is harmless by claim semantics.
    async fn requeue(&self, id: Uuid) -> GatewayResult<()>;

    /// `FAILED_TEMP` rows whose `retry_after` has passed, oldest update
    /// first.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>>;

    /// `QUEUED` rows older than `older_than`, creation order. Used by the
    /// bootstrap re-publish after broker loss.
    async fn stale_queued(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>>;

    /// `SENDING` rows whose `updated_at` is older than `older_than`.
    async fn stuck_sending(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> GatewayResult<Vec<Message>>;
}
