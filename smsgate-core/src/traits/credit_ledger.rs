use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::types::CreditLock;

/// Two-phase prepaid credit over the store: hold at intake, then capture on
/// delivery or release on failure. All three operations are atomic with
/// respect to a single client row.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct `amount_cents` from the client balance and record a `HELD`
    /// lock for `message_id`.
    ///
    /// Errors: `InsufficientCredit` when the balance cannot cover the
    /// amount; `LockConflict` when a lock for `message_id` already exists
    /// with a different amount. A repeat call with the same amount returns
    /// the existing `HELD` lock without a second deduction.
    async fn hold(
        &self,
        client_id: Uuid,
        message_id: Uuid,
        amount_cents: i64,
    ) -> GatewayResult<CreditLock>;

    /// `HELD -> CAPTURED`. Idempotent on an already-captured lock; errors
    /// with `LockNotHeld` when the lock is absent or released.
    async fn capture(&self, message_id: Uuid) -> GatewayResult<()>;

    /// `HELD -> RELEASED`, returning the amount to the client balance.
    /// Idempotent in effect: a second release is a no-op. Errors with
    /// `LockNotHeld` when the lock is absent or captured.
    async fn release(&self, message_id: Uuid) -> GatewayResult<()>;
}
