//! HTTP surface of the gateway.

mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use eyre::Result;
use sqlx::postgres::PgPool;
use tokio::sync::watch;
use tracing::info;

use smsgate_base::{Broker, CoreMetrics};
use smsgate_core::{ClientStore, MessageStore};

use crate::dlr::DlrIngestor;
use crate::intake::{IntakeService, Pricing};

pub use error::ApiError;

/// Everything the handlers need, constructed once at startup and threaded
/// through axum state.
pub struct AppState {
    /// Client lookup and authentication.
    pub clients: Arc<dyn ClientStore>,
    /// Message lookup for the read endpoints.
    pub messages: Arc<dyn MessageStore>,
    /// The intake pipeline.
    pub intake: IntakeService,
    /// Receipt ingestion.
    pub dlr: DlrIngestor,
    /// Shared metrics registry.
    pub metrics: Arc<CoreMetrics>,
    /// Pricing, for the `cost_cents` read-model field.
    pub pricing: Pricing,
    /// Pool handle for the readiness probe.
    pub db: PgPool,
    /// Broker handle for the readiness probe.
    pub broker: Broker,
    /// Flips to false once shutdown begins.
    pub ready: Arc<AtomicBool>,
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/me", get(handlers::me))
        .route(
            "/v1/messages",
            post(handlers::create_message).get(handlers::list_messages),
        )
        .route("/v1/messages/:id", get(handlers::get_message))
        .route("/v1/providers/mock/dlr", post(handlers::ingest_dlr))
        .route("/v1/admin/clients/:id/credit", post(handlers::topup))
        .with_state(state)
}

/// Serve until the shutdown signal flips.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API listening");
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
