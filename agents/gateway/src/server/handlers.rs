//! Request handlers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use smsgate_base::db;
use smsgate_core::{Client, DlrNotification, Message};

use crate::intake::{IntakeOutcome, SendRequest};

use super::{ApiError, AppState};

const API_KEY_HEADER: &str = "x-api-key";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const MAX_LIST_LIMIT: u32 = 100;

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Client, ApiError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::Unauthorized)?;
    state
        .clients
        .authenticate(key)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::Unauthorized)
}

/// `Message` plus the derived charge, as returned by the read endpoints.
#[derive(Serialize)]
struct MessageView {
    #[serde(flatten)]
    message: Message,
    cost_cents: i64,
}

impl MessageView {
    fn new(state: &AppState, message: Message) -> Self {
        let cost_cents = state.pricing.cost(message.parts, message.express);
        Self {
            message,
            cost_cents,
        }
    }
}

pub(super) async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub(super) async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "shutting down"})),
        );
    }
    if !db::ping(&state.db).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "database unreachable"})),
        );
    }
    if !state.broker.is_connected() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "broker unreachable"})),
        );
    }
    (StatusCode::OK, Json(json!({"status": "ready"})))
}

pub(super) async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}

pub(super) async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let client = authenticate(&state, &headers).await?;
    Ok(Json(json!({
        "id": client.id,
        "name": client.name,
        "credit_cents": client.credit_cents,
    })))
}

pub(super) async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = authenticate(&state, &headers).await?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .intake
        .send(&client, request, idempotency_key)
        .await
        .map_err(ApiError::from)?;

    let response = match outcome {
        IntakeOutcome::Accepted(message) | IntakeOutcome::Replayed(message) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message_id": message.id,
                "status": message.status,
            })),
        ),
        IntakeOutcome::OtpSent { message, otp_code } => (
            StatusCode::OK,
            Json(json!({
                "message_id": message.id,
                "status": message.status,
                "otp_code": otp_code,
            })),
        ),
    };
    Ok(response)
}

pub(super) async fn get_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let client = authenticate(&state, &headers).await?;
    let message = state
        .messages
        .get_for_client(id, client.id)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(MessageView::new(&state, message)))
}

#[derive(Deserialize)]
pub(super) struct ListQuery {
    #[serde(default)]
    limit: Option<u32>,
}

pub(super) async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let client = authenticate(&state, &headers).await?;
    let limit = query.limit.unwrap_or(50).min(MAX_LIST_LIMIT);
    let messages = state
        .messages
        .list_for_client(client.id, limit)
        .await
        .map_err(ApiError::from)?;
    let views: Vec<_> = messages
        .into_iter()
        .map(|message| MessageView::new(&state, message))
        .collect();
    Ok(Json(views))
}

pub(super) async fn ingest_dlr(
    State(state): State<Arc<AppState>>,
    Json(dlr): Json<DlrNotification>,
) -> Result<impl IntoResponse, ApiError> {
    state.dlr.ingest(dlr).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct TopupRequest {
    amount_cents: i64,
}

pub(super) async fn topup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<TopupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers).await?;
    if request.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "'amount_cents' must be positive".into(),
        ));
    }
    let credit_cents = state
        .clients
        .topup(id, request.amount_cents)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "id": id,
        "credit_cents": credit_cents,
    })))
}
