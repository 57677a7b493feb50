//! The gateway agent: constructs the shared state once and supervises the
//! HTTP server, the dispatcher and the recovery sweeper.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

use smsgate_base::{cache, db, supervise, AgentTask, BaseAgent, Broker, CoreMetrics, Settings};
use smsgate_base::stores::{
    PgClientStore, PgCreditLedger, PgMessageStore, RedisIdempotencyGate, RedisRateLimiter,
};
use smsgate_core::{ClientStore, CreditLedger, IdempotencyGate, MessageStore, RateLimiter, SmsProvider};

use crate::dlr::DlrIngestor;
use crate::intake::{IntakeService, Pricing};
use crate::msg::{Dispatcher, JobPublisher, MessageProcessor, RetryPolicy};
use crate::providers::{HttpProvider, MockProvider};
use crate::server::{self, AppState};
use crate::settings::GatewaySettings;
use crate::sweeper::Sweeper;

/// Rows examined per sweeper scan.
const SWEEP_BATCH: u32 = 100;

/// The assembled agent.
pub struct Gateway {
    settings: Settings,
    state: Arc<AppState>,
    dispatcher: Dispatcher,
    sweeper: Sweeper,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("port", &self.settings.port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BaseAgent for Gateway {
    const AGENT_NAME: &'static str = "gateway";

    type Settings = GatewaySettings;

    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized,
    {
        let base = settings.as_ref().clone();

        let pool = db::connect_pg(&base.postgres_url).await?;
        db::run_migrations(&pool).await?;
        let redis = cache::connect_redis(&base.redis_url).await?;
        let broker = Broker::connect(&base.nats_url).await?;

        let clients: Arc<dyn ClientStore> = Arc::new(PgClientStore::new(pool.clone()));
        let messages: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool.clone()));
        let credit: Arc<dyn CreditLedger> = Arc::new(PgCreditLedger::new(pool.clone()));
        let idempotency: Arc<dyn IdempotencyGate> =
            Arc::new(RedisIdempotencyGate::new(redis.clone()));
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(RedisRateLimiter::new(
            redis,
            base.rate_limit_rps,
            base.rate_limit_burst,
        ));
        let publisher: Arc<dyn JobPublisher> = Arc::new(broker.clone());

        let provider: Arc<dyn SmsProvider> = match &base.provider_url {
            Some(url) => Arc::new(HttpProvider::new(
                "http",
                url.clone(),
                base.provider_api_key.clone(),
            )),
            None => Arc::new(MockProvider::new()),
        };

        let pricing = Pricing {
            price_per_part_cents: base.price_per_part_cents,
            express_surcharge_cents: base.express_surcharge_cents,
        };
        let retry = RetryPolicy::from_settings(&base);

        let intake = IntakeService::new(
            messages.clone(),
            credit.clone(),
            idempotency,
            rate_limiter,
            publisher.clone(),
            provider.clone(),
            metrics.clone(),
            pricing,
        );
        let dlr = DlrIngestor::new(
            messages.clone(),
            credit.clone(),
            clients.clone(),
            metrics.clone(),
        );
        let processor = Arc::new(MessageProcessor::new(
            messages.clone(),
            credit,
            publisher.clone(),
            provider,
            metrics.clone(),
            retry,
        ));
        let dispatcher = Dispatcher::new(
            broker.clone(),
            publisher.clone(),
            processor,
            metrics.clone(),
            base.worker_mode,
            base.effective_pool_size(),
            base.effective_buffer_size(),
            base.worker_batch_size,
        );
        let sweeper = Sweeper::new(messages.clone(), publisher, SWEEP_BATCH);

        let state = Arc::new(AppState {
            clients,
            messages,
            intake,
            dlr,
            metrics,
            pricing,
            db: pool,
            broker,
            ready: Arc::new(AtomicBool::new(true)),
        });

        Ok(Self {
            settings: base,
            state,
            dispatcher,
            sweeper,
        })
    }

    async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ready = self.state.ready.clone();
        let signals = async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            // Readiness drops first so load balancers stop routing here
            // while in-flight work drains.
            ready.store(false, Ordering::Relaxed);
            let _ = shutdown_tx.send(true);
            Ok::<(), eyre::Report>(())
        };

        let tasks: Vec<AgentTask> = vec![
            (
                "signals",
                tokio::spawn(signals.instrument(info_span!("signals"))),
            ),
            (
                "http",
                tokio::spawn(
                    server::serve(self.state.clone(), self.settings.port, shutdown_rx.clone())
                        .instrument(info_span!("http")),
                ),
            ),
            (
                "dispatcher",
                tokio::spawn(
                    self.dispatcher
                        .run(shutdown_rx.clone())
                        .instrument(info_span!("dispatcher")),
                ),
            ),
            (
                "sweeper",
                tokio::spawn(self.sweeper.run(shutdown_rx).instrument(info_span!("sweeper"))),
            ),
        ];
        supervise(tasks).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
