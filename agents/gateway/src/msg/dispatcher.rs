//! Broker consumption and the bounded worker pool.
//!
//! One queue-group subscription feeds a bounded channel; a fixed pool of
//! workers drains it. When the channel is full the job is handed back to the
//! broker rather than dropped.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use smsgate_base::{Broker, CoreMetrics};
use smsgate_core::SendJob;

use super::{worker::MessageProcessor, JobPublisher};
use smsgate_base::settings::WorkerMode;

/// Pause before the second (and last) buffered enqueue attempt.
const ENQUEUE_RETRY_PAUSE: Duration = Duration::from_millis(50);
/// How long in-flight workers get to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the subscription, the channel and the pool.
pub struct Dispatcher {
    broker: Broker,
    publisher: Arc<dyn JobPublisher>,
    processor: Arc<MessageProcessor>,
    metrics: Arc<CoreMetrics>,
    mode: WorkerMode,
    pool_size: usize,
    buffer_size: usize,
    batch_size: usize,
}

impl Dispatcher {
    /// Assemble a dispatcher. `publisher` is the overflow path back to the
    /// broker; in production it is the same connection as `broker`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Broker,
        publisher: Arc<dyn JobPublisher>,
        processor: Arc<MessageProcessor>,
        metrics: Arc<CoreMetrics>,
        mode: WorkerMode,
        pool_size: usize,
        buffer_size: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            broker,
            publisher,
            processor,
            metrics,
            mode,
            pool_size,
            buffer_size,
            batch_size,
        }
    }

    /// Consume send jobs until shutdown, then drain the pool.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut subscriber = self
            .broker
            .subscribe_send_jobs()
            .await
            .map_err(|e| eyre!("subscribing to send jobs: {e}"))?;
        info!(
            pool = self.pool_size,
            buffer = self.buffer_size,
            mode = ?self.mode,
            "Dispatcher consuming"
        );

        let (tx, rx) = mpsc::channel::<SendJob>(self.buffer_size);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.pool_size {
            let rx = rx.clone();
            let processor = self.processor.clone();
            let mode = self.mode;
            let batch = self.batch_size.max(1);
            workers.spawn(async move {
                worker_loop(rx, processor, mode, batch).await;
            });
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dispatcher stopping consumption");
                        break;
                    }
                }
                delivery = subscriber.next() => {
                    let Some(delivery) = delivery else {
                        return Err(eyre!("send-job subscription ended"));
                    };
                    match serde_json::from_slice::<SendJob>(&delivery.payload) {
                        Ok(job) => self.enqueue(&tx, job).await,
                        Err(err) => {
                            warn!(error = %err, "Discarding undecodable send job");
                        }
                    }
                }
            }
        }

        // Close the channel so idle workers exit, then give in-flight ones a
        // bounded window before cancelling.
        drop(tx);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Drain window elapsed, aborting remaining workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        Ok(())
    }

    /// Put a job on the channel without ever dropping it: one bounded retry,
    /// then hand it back to the broker for redelivery.
    async fn enqueue(&self, tx: &mpsc::Sender<SendJob>, job: SendJob) {
        self.metrics
            .worker_queue_depth()
            .set((self.buffer_size - tx.capacity()) as i64);

        let job = match tx.try_send(job) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tokio::time::sleep(ENQUEUE_RETRY_PAUSE).await;
                match tx.try_send(job) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(job))
                    | Err(mpsc::error::TrySendError::Closed(job)) => job,
                }
            }
            Err(mpsc::error::TrySendError::Closed(job)) => job,
        };

        debug!(msg_id = %job.message_id, "Dispatch buffer full, returning job to broker");
        if let Err(err) = self.publisher.publish_send_job(&job).await {
            warn!(msg_id = %job.message_id, error = %err, "Overflow republish failed, blocking enqueue");
            // Last resort: block until a worker frees a slot. The job must
            // not be lost.
            if tx.send(job).await.is_err() {
                warn!("Dispatch channel closed during shutdown; sweeper will re-drive the row");
            }
        }
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<SendJob>>>,
    processor: Arc<MessageProcessor>,
    mode: WorkerMode,
    batch_size: usize,
) {
    loop {
        // Guard scope ends before processing so the pool keeps draining in
        // parallel.
        let first = { rx.lock().await.recv().await };
        let Some(first) = first else {
            break;
        };

        match mode {
            WorkerMode::Simple => processor.process(first).await,
            WorkerMode::Enhanced => {
                let mut local = vec![first];
                {
                    let mut guard = rx.lock().await;
                    while local.len() < batch_size {
                        match guard.try_recv() {
                            Ok(job) => local.push(job),
                            Err(_) => break,
                        }
                    }
                }
                for job in local {
                    processor.process(job).await;
                }
            }
        }
    }
}
