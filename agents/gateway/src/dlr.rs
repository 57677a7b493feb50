//! Delivery-receipt ingestion: resolve, finalize state and credit, and fire
//! the best-effort client callback.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use smsgate_base::CoreMetrics;
use smsgate_core::{
    ClientStore, CreditLedger, DlrNotification, DlrStatus, GatewayError, GatewayResult, Message,
    MessageStatus, MessageStore,
};

/// Deadline for the forwarded client callback.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body forwarded to the client's `dlr_callback_url`.
#[derive(Debug, Serialize)]
struct CallbackPayload {
    message_id: Uuid,
    status: MessageStatus,
    provider_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    timestamp: chrono::DateTime<Utc>,
}

/// Ingests provider receipts and finalizes billing.
pub struct DlrIngestor {
    messages: Arc<dyn MessageStore>,
    credit: Arc<dyn CreditLedger>,
    clients: Arc<dyn ClientStore>,
    metrics: Arc<CoreMetrics>,
    http: reqwest::Client,
}

impl DlrIngestor {
    /// Assemble the ingestor.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        credit: Arc<dyn CreditLedger>,
        clients: Arc<dyn ClientStore>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            messages,
            credit,
            clients,
            metrics,
            http: reqwest::Client::new(),
        }
    }

    /// Process one receipt. Unknown provider ids succeed silently so the
    /// provider does not retry forever; repeat receipts for terminal rows
    /// are no-ops.
    #[instrument(skip(self, dlr), fields(provider_message_id = %dlr.provider_message_id, status = ?dlr.status))]
    pub async fn ingest(&self, dlr: DlrNotification) -> GatewayResult<()> {
        self.metrics
            .dlr_received()
            .with_label_values(&[status_label(dlr.status)])
            .inc();

        let Some(message) = self
            .messages
            .get_by_provider_message_id(&dlr.provider_message_id)
            .await?
        else {
            warn!("DLR for unknown provider message id");
            return Ok(());
        };

        match dlr.status {
            DlrStatus::Delivered => {
                match self
                    .messages
                    .update_status(
                        message.id,
                        MessageStatus::Delivered,
                        Some(&dlr.provider_message_id),
                        dlr.reason.as_deref(),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(GatewayError::InvalidTransition { from, .. }) => {
                        debug!(%from, "Receipt for terminal row, ignoring");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
                match self.credit.capture(message.id).await {
                    Ok(()) => {}
                    Err(GatewayError::LockNotHeld { .. }) => {
                        warn!(msg_id = %message.id, "Delivered without a capturable lock");
                    }
                    Err(err) => return Err(err),
                }
                self.metrics
                    .messages_finalized()
                    .with_label_values(&["DELIVERED"])
                    .inc();
            }
            DlrStatus::FailedPerm => {
                match self
                    .messages
                    .update_status(
                        message.id,
                        MessageStatus::FailedPerm,
                        Some(&dlr.provider_message_id),
                        dlr.reason.as_deref(),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(GatewayError::InvalidTransition { from, .. }) => {
                        debug!(%from, "Receipt for terminal row, ignoring");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
                match self.credit.release(message.id).await {
                    Ok(()) => {}
                    Err(GatewayError::LockNotHeld { .. }) => {
                        warn!(msg_id = %message.id, "Nothing to release for failed message");
                    }
                    Err(err) => return Err(err),
                }
                self.metrics
                    .messages_finalized()
                    .with_label_values(&["FAILED_PERM"])
                    .inc();
            }
            DlrStatus::FailedTemp => {
                // No credit action: the hold stays in place while the
                // message goes back through the retry loop.
                let reason = dlr
                    .reason
                    .clone()
                    .unwrap_or_else(|| "provider reported temporary failure".to_string());
                self.messages
                    .schedule_retry(message.id, Utc::now(), &reason)
                    .await?;
            }
        }

        self.spawn_callback(message, dlr);
        Ok(())
    }

    /// Fire-and-best-effort forward to the client. Failures are logged and
    /// never retried.
    fn spawn_callback(&self, message: Message, dlr: DlrNotification) {
        let clients = self.clients.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            let client = match clients.get(message.client_id).await {
                Ok(Some(client)) => client,
                Ok(None) => return,
                Err(err) => {
                    warn!(client_id = %message.client_id, error = %err, "Callback client lookup failed");
                    return;
                }
            };
            let Some(url) = client.dlr_callback_url else {
                return;
            };

            let payload = CallbackPayload {
                message_id: message.id,
                status: callback_status(dlr.status),
                provider_message_id: dlr.provider_message_id,
                reason: dlr.reason,
                timestamp: dlr.timestamp,
            };
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "Callback payload serialization failed");
                    return;
                }
            };

            let mut request = http
                .post(&url)
                .header("content-type", "application/json")
                .timeout(CALLBACK_TIMEOUT)
                .body(body.clone());
            if let Some(secret) = &client.callback_hmac_secret {
                request = request.header("X-Signature", sign_callback(secret, &body));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "Callback rejected");
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "Callback delivery failed");
                }
            }
        });
    }
}

/// `X-Signature` value: HMAC-SHA256 over the exact body bytes.
pub fn sign_callback(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn status_label(status: DlrStatus) -> &'static str {
    match status {
        DlrStatus::Delivered => "DELIVERED",
        DlrStatus::FailedPerm => "FAILED_PERM",
        DlrStatus::FailedTemp => "FAILED_TEMP",
    }
}

fn callback_status(status: DlrStatus) -> MessageStatus {
    match status {
        DlrStatus::Delivered => MessageStatus::Delivered,
        DlrStatus::FailedPerm => MessageStatus::FailedPerm,
        DlrStatus::FailedTemp => MessageStatus::FailedTemp,
    }
}
