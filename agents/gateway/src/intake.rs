//! Intake: validation, costing, credit hold, persistence and publish. Owns
//! the synchronous OTP path.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{instrument, warn};
use uuid::Uuid;

use smsgate_base::CoreMetrics;
use smsgate_core::{
    calculate_parts, Client, CreditLedger, GatewayError, GatewayResult, IdempotencyGate, Message,
    MessageStatus, MessageStore, NewMessage, OutboundSms, RateDecision, RateLimiter, SendJob,
    SendStatus, SmsProvider,
};

use crate::msg::JobPublisher;

/// Deadline for the synchronous OTP provider call.
const OTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest accepted client reference.
const MAX_CLIENT_REFERENCE: usize = 64;
/// Longest accepted idempotency key.
const MAX_IDEMPOTENCY_KEY: usize = 128;

/// A send request as received on the wire. Unknown fields are ignored for
/// forward compatibility.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Destination MSISDN.
    pub to: String,
    /// Sender id.
    pub from: String,
    /// Body; may be empty only for OTP requests.
    #[serde(default)]
    pub text: String,
    /// Client-side correlation reference.
    #[serde(default)]
    pub client_reference: Option<String>,
    /// Synchronous verification-code path.
    #[serde(default)]
    pub otp: bool,
    /// Premium class.
    #[serde(default)]
    pub express: bool,
}

/// What intake decided.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// Fresh message, queued for the worker pool.
    Accepted(Message),
    /// A prior request with the same idempotency key already created this
    /// message; nothing was charged or enqueued.
    Replayed(Message),
    /// OTP delivered synchronously.
    OtpSent {
        /// The persisted message, already `SENT` and captured.
        message: Message,
        /// The generated verification code.
        otp_code: String,
    },
}

/// Per-part pricing.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    /// Cents per part.
    pub price_per_part_cents: i64,
    /// Extra cents per part for express.
    pub express_surcharge_cents: i64,
}

impl Pricing {
    /// Total charge for a message of `parts` parts.
    pub fn cost(&self, parts: u32, express: bool) -> i64 {
        let per_part = if express {
            self.price_per_part_cents + self.express_surcharge_cents
        } else {
            self.price_per_part_cents
        };
        i64::from(parts) * per_part
    }
}

/// The intake pipeline. One instance shared by all HTTP handler tasks.
pub struct IntakeService {
    messages: Arc<dyn MessageStore>,
    credit: Arc<dyn CreditLedger>,
    idempotency: Arc<dyn IdempotencyGate>,
    rate_limiter: Arc<dyn RateLimiter>,
    publisher: Arc<dyn JobPublisher>,
    provider: Arc<dyn SmsProvider>,
    metrics: Arc<CoreMetrics>,
    pricing: Pricing,
}

impl IntakeService {
    /// Assemble the pipeline from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Arc<dyn MessageStore>,
        credit: Arc<dyn CreditLedger>,
        idempotency: Arc<dyn IdempotencyGate>,
        rate_limiter: Arc<dyn RateLimiter>,
        publisher: Arc<dyn JobPublisher>,
        provider: Arc<dyn SmsProvider>,
        metrics: Arc<CoreMetrics>,
        pricing: Pricing,
    ) -> Self {
        Self {
            messages,
            credit,
            idempotency,
            rate_limiter,
            publisher,
            provider,
            metrics,
            pricing,
        }
    }

    /// Run the full intake sequence for an authenticated client.
    #[instrument(skip(self, client, request), fields(client_id = %client.id, otp = request.otp))]
    pub async fn send(
        &self,
        client: &Client,
        request: SendRequest,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<IntakeOutcome> {
        validate(&request, idempotency_key)?;

        match self.rate_limiter.check(client.id).await? {
            RateDecision::Allowed => {}
            RateDecision::Limited {
                retry_after_seconds,
            } => {
                return Err(GatewayError::RateLimited {
                    retry_after_seconds,
                })
            }
        }

        if let Some(key) = idempotency_key {
            if let Some(prior) = self.idempotency.get(client.id, key).await? {
                if let Some(message) = self.messages.get_for_client(prior, client.id).await? {
                    return Ok(IntakeOutcome::Replayed(message));
                }
                // Mapping outlived its message (the hold was unwound);
                // treat the request as fresh.
            }
        }

        if request.otp {
            self.send_otp(client, request, idempotency_key).await
        } else {
            self.send_queued(client, request, idempotency_key).await
        }
    }

    async fn send_queued(
        &self,
        client: &Client,
        request: SendRequest,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<IntakeOutcome> {
        let parts = calculate_parts(&request.text);
        let cost = self.pricing.cost(parts, request.express);
        let id = Uuid::new_v4();

        let message = self
            .messages
            .create(NewMessage {
                id,
                client_id: client.id,
                to: request.to,
                from: request.from,
                text: request.text,
                parts,
                client_reference: request.client_reference,
                express: request.express,
            })
            .await?;

        if let Err(err) = self.credit.hold(client.id, id, cost).await {
            // No hold exists; just take the row back out.
            let _ = self.messages.delete(id).await;
            return Err(err);
        }

        // From here until the publish lands, cancellation must give the
        // credit back and remove the row.
        let mut unwind = HoldUnwind::arm(self.credit.clone(), self.messages.clone(), id);

        if let Some(key) = idempotency_key {
            if let Err(err) = self.idempotency.put(client.id, key, id).await {
                // Best-effort: the message stands even if replay protection
                // could not be recorded.
                warn!(client_id = %client.id, error = %err, "Failed to persist idempotency key");
            }
        }

        let job = SendJob {
            message_id: id,
            attempt: 1,
        };
        if let Err(err) = self.publisher.publish_send_job(&job).await {
            unwind.disarm();
            // Same contract as the cancellation unwind: after the hold and
            // before the publish, failure gives the credit back and takes
            // the row out.
            let _ = self.credit.release(id).await;
            let _ = self.messages.delete(id).await;
            return Err(err);
        }

        unwind.disarm();
        self.metrics.messages_accepted().inc();
        Ok(IntakeOutcome::Accepted(message))
    }

    async fn send_otp(
        &self,
        client: &Client,
        request: SendRequest,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<IntakeOutcome> {
        let otp_code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let text = if request.text.is_empty() {
            format!("Your verification code is {otp_code}")
        } else {
            request.text
        };
        let parts = calculate_parts(&text);
        let cost = self.pricing.cost(parts, request.express);
        let id = Uuid::new_v4();

        self.messages
            .create(NewMessage {
                id,
                client_id: client.id,
                to: request.to.clone(),
                from: request.from.clone(),
                text: text.clone(),
                parts,
                client_reference: request.client_reference,
                express: request.express,
            })
            .await?;

        if let Err(err) = self.credit.hold(client.id, id, cost).await {
            let _ = self.messages.delete(id).await;
            return Err(err);
        }
        let mut unwind = HoldUnwind::arm(self.credit.clone(), self.messages.clone(), id);

        if let Some(key) = idempotency_key {
            if let Err(err) = self.idempotency.put(client.id, key, id).await {
                warn!(client_id = %client.id, error = %err, "Failed to persist idempotency key");
            }
        }

        // The OTP path bypasses the broker: either the provider takes the
        // message now or the caller hears about it now.
        let sms = OutboundSms {
            message_id: id,
            to: request.to,
            from: request.from,
            text,
        };
        let outcome = match tokio::time::timeout(OTP_TIMEOUT, self.provider.send(&sms, OTP_TIMEOUT))
            .await
        {
            Ok(Ok(outcome)) if outcome.status == SendStatus::Sent => outcome,
            Ok(Ok(outcome)) => {
                unwind.disarm();
                self.unwind_otp(id).await;
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "provider rejected the message".to_string());
                return Err(GatewayError::ProviderTemporary(reason));
            }
            Ok(Err(err)) => {
                unwind.disarm();
                self.unwind_otp(id).await;
                return Err(GatewayError::ProviderTemporary(err.to_string()));
            }
            Err(_) => {
                unwind.disarm();
                self.unwind_otp(id).await;
                return Err(GatewayError::Timeout("otp provider send"));
            }
        };

        unwind.disarm();
        self.messages
            .update_status(
                id,
                MessageStatus::Sent,
                outcome.provider_message_id.as_deref(),
                None,
            )
            .await?;
        // The synchronous ack is the only confirmation this path gets.
        self.credit.capture(id).await?;
        self.metrics.messages_accepted().inc();

        let message = self
            .messages
            .get(id)
            .await?
            .ok_or(GatewayError::NotFound("message"))?;
        Ok(IntakeOutcome::OtpSent { message, otp_code })
    }

    async fn unwind_otp(&self, id: Uuid) {
        if let Err(err) = self.credit.release(id).await {
            warn!(msg_id = %id, error = %err, "OTP unwind release failed");
        }
        if let Err(err) = self.messages.delete(id).await {
            warn!(msg_id = %id, error = %err, "OTP unwind delete failed");
        }
    }
}

fn validate(request: &SendRequest, idempotency_key: Option<&str>) -> GatewayResult<()> {
    if request.to.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("'to' is required".into()));
    }
    if request.from.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("'from' is required".into()));
    }
    if request.text.is_empty() && !request.otp {
        return Err(GatewayError::InvalidRequest("'text' is required".into()));
    }
    if let Some(reference) = &request.client_reference {
        if reference.chars().count() > MAX_CLIENT_REFERENCE {
            return Err(GatewayError::InvalidRequest(format!(
                "'client_reference' exceeds {MAX_CLIENT_REFERENCE} characters"
            )));
        }
    }
    if let Some(key) = idempotency_key {
        if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY {
            return Err(GatewayError::InvalidRequest(format!(
                "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY} characters"
            )));
        }
    }
    Ok(())
}

/// Releases the hold and removes the message if the intake future is dropped
/// between the hold and the publish.
struct HoldUnwind {
    credit: Arc<dyn CreditLedger>,
    messages: Arc<dyn MessageStore>,
    message_id: Uuid,
    armed: bool,
}

impl HoldUnwind {
    fn arm(
        credit: Arc<dyn CreditLedger>,
        messages: Arc<dyn MessageStore>,
        message_id: Uuid,
    ) -> Self {
        Self {
            credit,
            messages,
            message_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for HoldUnwind {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let credit = self.credit.clone();
        let messages = self.messages.clone();
        let id = self.message_id;
        warn!(msg_id = %id, "Intake cancelled after hold; unwinding");
        handle.spawn(async move {
            if let Err(err) = credit.release(id).await {
                warn!(msg_id = %id, error = %err, "Cancelled-intake release failed");
            }
            if let Err(err) = messages.delete(id).await {
                warn!(msg_id = %id, error = %err, "Cancelled-intake delete failed");
            }
        });
    }
}
