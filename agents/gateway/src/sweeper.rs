//! Recovery sweeper: re-drives rows whose jobs the broker or a crashed
//! worker lost. This is what lets delayed retries live on best-effort local
//! timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::Result;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use smsgate_core::{Message, MessageStore, SendJob};

use crate::msg::JobPublisher;

/// Pass cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// A `SENDING` row untouched for this long lost its worker.
const STUCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// `QUEUED` rows older than this at startup get their job republished.
const BOOTSTRAP_GRACE: Duration = Duration::from_secs(60);

/// Periodic scan-and-republish over the message store.
pub struct Sweeper {
    messages: Arc<dyn MessageStore>,
    publisher: Arc<dyn JobPublisher>,
    batch_size: u32,
}

impl Sweeper {
    /// Assemble a sweeper.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        publisher: Arc<dyn JobPublisher>,
        batch_size: u32,
    ) -> Self {
        Self {
            messages,
            publisher,
            batch_size: batch_size.max(1),
        }
    }

    /// Run until shutdown. One bootstrap pass covers jobs lost to a broker
    /// outage before the first interval elapses.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(err) = self.republish_stale_queued().await {
            warn!(error = %err, "Bootstrap republish failed");
        }

        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sweeper stopping");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// One full pass: stuck `SENDING` rows back to `QUEUED`, then due
    /// `FAILED_TEMP` rows back onto the send subject.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        match self
            .messages
            .stuck_sending(now - chrono_duration(STUCK_TIMEOUT), self.batch_size)
            .await
        {
            Ok(stuck) => {
                for message in stuck {
                    warn!(msg_id = %message.id, attempts = message.attempts, "Re-driving stuck SENDING row");
                    if let Err(err) = self.messages.requeue(message.id).await {
                        warn!(msg_id = %message.id, error = %err, "Requeue failed");
                        continue;
                    }
                    self.republish(&message).await;
                }
            }
            Err(err) => warn!(error = %err, "Stuck-row scan failed"),
        }

        match self.messages.due_retries(now, self.batch_size).await {
            Ok(due) => {
                for message in due {
                    self.republish(&message).await;
                }
            }
            Err(err) => warn!(error = %err, "Due-retry scan failed"),
        }
    }

    async fn republish_stale_queued(&self) -> smsgate_core::GatewayResult<()> {
        let cutoff = Utc::now() - chrono_duration(BOOTSTRAP_GRACE);
        let stale = self.messages.stale_queued(cutoff, self.batch_size).await?;
        if !stale.is_empty() {
            info!(count = stale.len(), "Republishing stale queued messages");
        }
        for message in stale {
            self.republish(&message).await;
        }
        Ok(())
    }

    async fn republish(&self, message: &Message) {
        let job = SendJob {
            message_id: message.id,
            attempt: message.attempts + 1,
        };
        if let Err(err) = self.publisher.publish_send_job(&job).await {
            // The next pass sees the same row again; nothing is lost.
            warn!(msg_id = %message.id, error = %err, "Sweeper republish failed");
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::*;
    use smsgate_core::MessageStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn stuck_sending_rows_are_requeued_and_republished() {
        let messages = Arc::new(MemMessageStore::default());
        let publisher = Arc::new(MemPublisher::default());
        let client = Uuid::new_v4();

        let stuck = messages.seed_with_status(client, MessageStatus::Sending).await;
        messages.age_updated_at(stuck.id, Duration::from_secs(6 * 60));
        // A fresh SENDING row must be left alone.
        let fresh = messages.seed_with_status(client, MessageStatus::Sending).await;

        let sweeper = Sweeper::new(messages.clone(), publisher.clone(), 100);
        sweeper.sweep_once().await;

        assert_eq!(
            messages.get(stuck.id).await.unwrap().unwrap().status,
            MessageStatus::Queued
        );
        assert_eq!(
            messages.get(fresh.id).await.unwrap().unwrap().status,
            MessageStatus::Sending
        );
        let jobs = publisher.send_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message_id, stuck.id);
    }

    #[tokio::test]
    async fn due_failed_temp_rows_are_republished() {
        let messages = Arc::new(MemMessageStore::default());
        let publisher = Arc::new(MemPublisher::default());
        let client = Uuid::new_v4();

        let due = messages.seed_with_status(client, MessageStatus::FailedTemp).await;
        messages.make_due(due.id).await;
        // Not yet due: retry_after unset.
        messages.seed_with_status(client, MessageStatus::FailedTemp).await;

        let sweeper = Sweeper::new(messages.clone(), publisher.clone(), 100);
        sweeper.sweep_once().await;

        let jobs = publisher.send_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message_id, due.id);
        // The row itself stays FAILED_TEMP until a worker claims it.
        assert_eq!(
            messages.get(due.id).await.unwrap().unwrap().status,
            MessageStatus::FailedTemp
        );
    }

    #[tokio::test]
    async fn bootstrap_republishes_old_queued_rows() {
        let messages = Arc::new(MemMessageStore::default());
        let publisher = Arc::new(MemPublisher::default());
        let client = Uuid::new_v4();

        let old = messages.seed_queued(client).await;
        messages.age_created_at(old.id, Duration::from_secs(5 * 60));
        messages.seed_queued(client).await; // fresh, still in the broker

        let sweeper = Sweeper::new(messages.clone(), publisher.clone(), 100);
        sweeper.republish_stale_queued().await.unwrap();

        let jobs = publisher.send_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message_id, old.id);
    }
}
