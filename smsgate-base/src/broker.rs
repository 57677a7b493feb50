//! NATS broker wiring: one multiplexed connection per process, queue-group
//! subscriptions for send jobs, and a dead-letter subject.

use std::time::Duration;

use async_nats::{Client, ConnectOptions, Subscriber};
use serde::Serialize;
use tracing::info;

use smsgate_core::{DlqJob, GatewayError, GatewayResult, SendJob};

/// Subject carrying send jobs; consumed via queue group for load balancing.
pub const SUBJECT_SEND: &str = "sms.send";
/// Subject carrying permanently failed jobs.
pub const SUBJECT_DLQ: &str = "sms.dlq";
/// Queue group name for the worker pool.
pub const QUEUE_GROUP: &str = "sms-workers";

/// Delay between reconnect attempts. Retries are unbounded.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Publish (including flush) deadline.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the gateway's single NATS connection.
#[derive(Debug, Clone)]
pub struct Broker {
    client: Client,
}

impl Broker {
    /// Connect to the broker. The connection retries indefinitely, both at
    /// startup and after a drop.
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
            .connect(url)
            .await
            .map_err(GatewayError::broker)?;
        info!(url, "Broker connection established");
        Ok(Self { client })
    }

    /// Publish a send job on `sms.send`.
    pub async fn publish_send_job(&self, job: &SendJob) -> GatewayResult<()> {
        self.publish(SUBJECT_SEND, job).await
    }

    /// Publish a dead-letter record on `sms.dlq`.
    pub async fn publish_dlq(&self, job: &DlqJob) -> GatewayResult<()> {
        self.publish(SUBJECT_DLQ, job).await
    }

    async fn publish<T: Serialize>(&self, subject: &'static str, payload: &T) -> GatewayResult<()> {
        let bytes = serde_json::to_vec(payload).map_err(GatewayError::broker)?;
        let fut = async {
            self.client
                .publish(subject, bytes.into())
                .await
                .map_err(GatewayError::broker)?;
            // publish only buffers; flush pushes it onto the wire.
            self.client.flush().await.map_err(GatewayError::broker)
        };
        tokio::time::timeout(PUBLISH_TIMEOUT, fut)
            .await
            .map_err(|_| GatewayError::Timeout("broker publish"))?
    }

    /// Queue-group subscription on `sms.send`; each job goes to exactly one
    /// member of the group.
    pub async fn subscribe_send_jobs(&self) -> GatewayResult<Subscriber> {
        self.client
            .queue_subscribe(SUBJECT_SEND, QUEUE_GROUP.into())
            .await
            .map_err(GatewayError::broker)
    }

    /// Whether the connection currently looks healthy.
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
