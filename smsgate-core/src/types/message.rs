use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle states of a message.
///
/// ```text
/// QUEUED -> SENDING -> SENT -> DELIVERED
///    ^        |          |
///    |        +-> FAILED_TEMP -> (requeue)
///    |        +-> FAILED_PERM
///    +------- DLR failed_temp --+
/// ```
///
/// `DELIVERED`, `FAILED_PERM` and `CANCELLED` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Claimed by exactly one worker; a provider call may be in flight.
    Sending,
    /// Provider acknowledged submission; awaiting the delivery receipt.
    Sent,
    /// Provider confirmed handset delivery.
    Delivered,
    /// Transient failure; scheduled for another attempt.
    FailedTemp,
    /// Permanent failure; credit released, job dead-lettered.
    FailedPerm,
    /// Administratively withdrawn.
    Cancelled,
}

impl MessageStatus {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::FailedPerm | Self::Cancelled)
    }

    /// Whether a row in this state may be claimed by a worker.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::FailedTemp)
    }

    /// State-machine check used by the store before a generic update. Claim
    /// and attempt accounting go through the dedicated conditional-update
    /// path instead.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        !self.is_terminal() || self == next
    }
}

/// A message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier, minted at intake.
    pub id: Uuid,
    /// Owning client.
    pub client_id: Uuid,
    /// Destination MSISDN.
    pub to: String,
    /// Sender id.
    pub from: String,
    /// Message body.
    pub text: String,
    /// PDU count, fixed at creation from `text`.
    pub parts: u32,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Client-supplied correlation reference.
    pub client_reference: Option<String>,
    /// Name of the provider that handled (or is handling) the send.
    pub provider: Option<String>,
    /// Identifier the provider assigned on submission; DLRs resolve by it.
    pub provider_message_id: Option<String>,
    /// Send attempts so far.
    pub attempts: u32,
    /// Most recent failure detail.
    pub last_error: Option<String>,
    /// Premium class: larger retry budget, shorter delays.
    pub express: bool,
    /// Earliest time the next attempt may run, for `FAILED_TEMP` rows.
    pub retry_after: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields the intake path supplies when persisting a fresh message. The
/// store fills in `status = QUEUED`, `attempts = 0` and the timestamps.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Message identifier, minted by the caller so the credit hold can
    /// reference it before the row exists.
    pub id: Uuid,
    /// Owning client.
    pub client_id: Uuid,
    /// Destination MSISDN.
    pub to: String,
    /// Sender id.
    pub from: String,
    /// Message body.
    pub text: String,
    /// PDU count.
    pub parts: u32,
    /// Client-supplied correlation reference.
    pub client_reference: Option<String>,
    /// Premium class flag.
    pub express: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states_reject_transitions() {
        for terminal in [
            MessageStatus::Delivered,
            MessageStatus::FailedPerm,
            MessageStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(MessageStatus::Queued));
            assert!(!terminal.can_transition_to(MessageStatus::Sending));
            // Repeating the same terminal state is a permitted no-op.
            assert!(terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn only_queued_and_failed_temp_are_claimable() {
        assert!(MessageStatus::Queued.is_claimable());
        assert!(MessageStatus::FailedTemp.is_claimable());
        assert!(!MessageStatus::Sending.is_claimable());
        assert!(!MessageStatus::Sent.is_claimable());
        assert!(!MessageStatus::Delivered.is_claimable());
    }

    #[test]
    fn status_round_trips_through_strings() {
        use std::str::FromStr;
        for status in [
            MessageStatus::Queued,
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::FailedTemp,
            MessageStatus::FailedPerm,
            MessageStatus::Cancelled,
        ] {
            let text = status.to_string();
            assert_eq!(MessageStatus::from_str(&text).unwrap(), status);
        }
        assert_eq!(MessageStatus::FailedTemp.to_string(), "FAILED_TEMP");
    }
}
