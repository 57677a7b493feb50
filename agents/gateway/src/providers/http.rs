//! HTTP provider: submits messages to an upstream SMSC-fronting REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smsgate_core::{GatewayResult, OutboundSms, ProviderSendOutcome, SmsProvider};

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    message_id: Uuid,
    to: &'a str,
    from: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A provider reached over HTTP. The upstream acks submission with its own
/// message id; delivery receipts arrive separately on the DLR route.
pub struct HttpProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Build a provider for the given endpoint.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SmsProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        sms: &OutboundSms,
        deadline: Duration,
    ) -> GatewayResult<ProviderSendOutcome> {
        let body = UpstreamRequest {
            message_id: sms.message_id,
            to: &sms.to,
            from: &sms.from,
            text: &sms.text,
        };

        let mut request = self.http.post(&self.endpoint).timeout(deadline).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Transport failures, timeouts included, never tell us whether
            // the upstream saw the message: retry.
            Err(err) => return Ok(ProviderSendOutcome::failed_temp(err.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            let parsed: UpstreamResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Ok(ProviderSendOutcome::failed_temp(format!(
                        "undecodable upstream ack: {err}"
                    )))
                }
            };
            let provider_message_id = parsed
                .message_id
                .unwrap_or_else(|| format!("{}-{}", self.name, sms.message_id.simple()));
            return Ok(ProviderSendOutcome::sent(provider_message_id));
        }

        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        let outcome = if status.as_u16() == 408
            || status.as_u16() == 429
            || status.is_server_error()
        {
            ProviderSendOutcome::failed_temp(format!("upstream {status}: {detail}"))
        } else {
            ProviderSendOutcome::failed_perm(format!("upstream {status}: {detail}"))
        };
        Ok(outcome)
    }
}
