use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was consumed; let the request through.
    Allowed,
    /// Bucket empty.
    Limited {
        /// Seconds until a token becomes available.
        retry_after_seconds: u64,
    },
}

impl RateDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Per-client token bucket. The refill-and-take step must be atomic in the
/// backing store; a read-modify-write race would allow burst overspend.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one token from the client's bucket, refilling first.
    async fn check(&self, client_id: Uuid) -> GatewayResult<RateDecision>;
}
