use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayResult;

/// What a provider did with a submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted for onward delivery.
    Sent,
    /// Rejected in a way worth retrying (congestion, timeout, 5xx).
    FailedTemp,
    /// Rejected for good (invalid destination, blocked sender).
    FailedPerm,
}

/// The message handed to a provider for one attempt.
#[derive(Debug, Clone)]
pub struct OutboundSms {
    /// Gateway-side message id, passed through for reconciliation.
    pub message_id: Uuid,
    /// Destination MSISDN.
    pub to: String,
    /// Sender id.
    pub from: String,
    /// Body.
    pub text: String,
}

/// Result of one provider submission.
#[derive(Debug, Clone)]
pub struct ProviderSendOutcome {
    /// Identifier the provider minted for this submission. Present on
    /// `Sent`; DLRs reference it.
    pub provider_message_id: Option<String>,
    /// Accepted / retryable / permanent.
    pub status: SendStatus,
    /// Failure detail when not accepted.
    pub error: Option<String>,
}

impl ProviderSendOutcome {
    /// A successful submission ack.
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: Some(provider_message_id.into()),
            status: SendStatus::Sent,
            error: None,
        }
    }

    /// A retryable rejection.
    pub fn failed_temp(error: impl Into<String>) -> Self {
        Self {
            provider_message_id: None,
            status: SendStatus::FailedTemp,
            error: Some(error.into()),
        }
    }

    /// A permanent rejection.
    pub fn failed_perm(error: impl Into<String>) -> Self {
        Self {
            provider_message_id: None,
            status: SendStatus::FailedPerm,
            error: Some(error.into()),
        }
    }
}

/// An outbound SMS provider. Implementations must be safe to call from many
/// workers at once and must respect `deadline`; callers additionally fence
/// the call with a timeout and treat the elapse as `FailedTemp`.
#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Stable provider name, recorded on the message row.
    fn name(&self) -> &str;

    /// Submit one message.
    async fn send(
        &self,
        sms: &OutboundSms,
        deadline: Duration,
    ) -> GatewayResult<ProviderSendOutcome>;
}
