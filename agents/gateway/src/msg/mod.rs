//! Message dispatch: the broker consumer, the bounded worker pool, and the
//! per-attempt processing logic.

pub mod backoff;
pub mod dispatcher;
pub mod worker;

use async_trait::async_trait;

use smsgate_base::Broker;
use smsgate_core::{DlqJob, GatewayResult, SendJob};

pub use backoff::RetryPolicy;
pub use dispatcher::Dispatcher;
pub use worker::MessageProcessor;

/// Seam over the broker's publish side so processing logic can be exercised
/// without a live connection.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Enqueue a send job.
    async fn publish_send_job(&self, job: &SendJob) -> GatewayResult<()>;

    /// Dead-letter a permanently failed message.
    async fn publish_dlq(&self, job: &DlqJob) -> GatewayResult<()>;
}

#[async_trait]
impl JobPublisher for Broker {
    async fn publish_send_job(&self, job: &SendJob) -> GatewayResult<()> {
        Broker::publish_send_job(self, job).await
    }

    async fn publish_dlq(&self, job: &DlqJob) -> GatewayResult<()> {
        Broker::publish_dlq(self, job).await
    }
}
