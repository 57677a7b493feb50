use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Two-phase lifecycle of a credit lock. `CAPTURED` and `RELEASED` are
/// irreversible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Amount deducted from the client balance, outcome pending.
    Held,
    /// Amount recognized as revenue after confirmed delivery.
    Captured,
    /// Amount returned to the client balance after permanent failure.
    Released,
}

impl LockState {
    /// Whether the lock can still move.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Captured | Self::Released)
    }
}

/// A hold against a client's prepaid balance, one per message at most.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLock {
    /// Lock identifier.
    pub id: Uuid,
    /// Client whose balance was debited.
    pub client_id: Uuid,
    /// The message this hold pays for. Unique across all locks.
    pub message_id: Uuid,
    /// Debited amount. Positive.
    pub amount_cents: i64,
    /// Hold / capture / release state.
    pub state: LockState,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}
