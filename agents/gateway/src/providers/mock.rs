//! Mock provider for local development and the mock DLR route.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use smsgate_core::{GatewayResult, OutboundSms, ProviderSendOutcome, SmsProvider};

/// Simulated submission latency.
const MOCK_LATENCY: Duration = Duration::from_millis(50);

/// A provider that accepts most messages after a short delay and fails a
/// configurable fraction, for exercising the retry and DLQ paths locally.
pub struct MockProvider {
    temp_failure_rate: f64,
    perm_failure_rate: f64,
}

impl MockProvider {
    /// Failure mix used when nothing is configured.
    pub fn new() -> Self {
        Self {
            temp_failure_rate: 0.10,
            perm_failure_rate: 0.02,
        }
    }

    /// A mock that always acks, for OTP-style local flows.
    pub fn always_sent() -> Self {
        Self {
            temp_failure_rate: 0.0,
            perm_failure_rate: 0.0,
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmsProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        _sms: &OutboundSms,
        deadline: Duration,
    ) -> GatewayResult<ProviderSendOutcome> {
        tokio::time::sleep(MOCK_LATENCY.min(deadline)).await;

        let roll: f64 = rand::thread_rng().gen();
        let outcome = if roll < self.perm_failure_rate {
            ProviderSendOutcome::failed_perm("mock: destination rejected")
        } else if roll < self.perm_failure_rate + self.temp_failure_rate {
            ProviderSendOutcome::failed_temp("mock: network congestion")
        } else {
            ProviderSendOutcome::sent(format!("mock-{}", Uuid::new_v4().simple()))
        };
        Ok(outcome)
    }
}
