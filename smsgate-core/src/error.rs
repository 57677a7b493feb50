//! Error taxonomy shared across the gateway.

use std::error::Error as StdError;

use crate::types::MessageStatus;

/// Convenience alias used by every fallible gateway operation.
pub type GatewayResult<T> = Result<T, GatewayError>;

type BoxedError = Box<dyn StdError + Send + Sync>;

/// The internal error taxonomy. The HTTP layer maps these onto wire status
/// codes; workers decide retry-vs-DLQ from the provider variants.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The client row does not carry enough credit for the requested hold.
    #[error("insufficient credit: required {required_cents}, available {available_cents}")]
    InsufficientCredit {
        /// Cents needed to cover the message.
        required_cents: i64,
        /// Cents actually available on the client row.
        available_cents: i64,
    },

    /// A credit lock already exists for this message with a different amount.
    #[error("credit lock conflict for message {message_id}")]
    LockConflict {
        /// Message the conflicting lock belongs to.
        message_id: uuid::Uuid,
    },

    /// Capture/release was attempted against a lock that is absent or in a
    /// state that cannot move to the requested one.
    #[error("credit lock for message {message_id} is not held")]
    LockNotHeld {
        /// Message the lock was looked up by.
        message_id: uuid::Uuid,
    },

    /// A state-machine transition the message store refuses. Callers treat
    /// this as non-fatal: the row is already where a previous actor put it.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Status the row currently holds.
        from: MessageStatus,
        /// Status the caller asked for.
        to: MessageStatus,
    },

    /// A request that fails validation before any side effect.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Entity lookup miss.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Per-client token bucket is empty.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until at least one token is available again.
        retry_after_seconds: u64,
    },

    /// The provider rejected the message in a way worth retrying.
    #[error("transient provider failure: {0}")]
    ProviderTemporary(String),

    /// The provider rejected the message permanently.
    #[error("permanent provider failure: {0}")]
    ProviderPermanent(String),

    /// A deadline elapsed while waiting on an external collaborator.
    #[error("timed out waiting on {0}")]
    Timeout(&'static str),

    /// Relational store failure.
    #[error("database failure: {0}")]
    Database(#[source] BoxedError),

    /// Key-value store failure (rate limiter / idempotency gate).
    #[error("cache failure: {0}")]
    Cache(#[source] BoxedError),

    /// Broker publish/consume failure.
    #[error("broker failure: {0}")]
    Broker(#[source] BoxedError),

    /// Anything that does not fit the variants above.
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Wrap a storage-layer error.
    pub fn database(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Database(Box::new(err))
    }

    /// Wrap a key-value-layer error.
    pub fn cache(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Cache(Box::new(err))
    }

    /// Wrap a broker-layer error.
    pub fn broker(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Broker(Box::new(err))
    }

    /// Whether a worker should schedule another attempt after seeing this.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderTemporary(_) | Self::Timeout(_) | Self::Broker(_)
        )
    }
}
