use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload published on the send subject. One job per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJob {
    /// Message to (re)attempt.
    pub message_id: Uuid,
    /// 1-based attempt number this job represents.
    pub attempt: u32,
}

/// Payload published on the dead-letter subject once a message fails
/// permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqJob {
    /// The permanently failed message.
    pub message_id: Uuid,
    /// Short failure reason.
    pub reason: String,
    /// When the message was dead-lettered.
    pub timestamp: DateTime<Utc>,
}

/// Terminal (or near-terminal) outcome a provider reports asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlrStatus {
    /// Handset delivery confirmed.
    Delivered,
    /// Delivery failed for good.
    FailedPerm,
    /// Delivery failed but the provider suggests retrying.
    FailedTemp,
}

/// A delivery receipt as ingested from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlrNotification {
    /// Provider-side identifier from the original submission ack.
    pub provider_message_id: String,
    /// Reported outcome.
    pub status: DlrStatus,
    /// Optional provider-supplied detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Provider-side event time.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn send_job_wire_format_is_stable() {
        let job = SendJob {
            message_id: Uuid::nil(),
            attempt: 3,
        };
        let encoded = serde_json::to_string(&job).unwrap();
        assert_eq!(
            encoded,
            r#"{"message_id":"00000000-0000-0000-0000-000000000000","attempt":3}"#
        );
        let decoded: SendJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn dlr_status_uses_screaming_snake_case() {
        let dlr: DlrNotification = serde_json::from_str(
            r#"{"provider_message_id":"mock-1","status":"FAILED_TEMP","timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(dlr.status, DlrStatus::FailedTemp);
        assert!(dlr.reason.is_none());
    }
}
