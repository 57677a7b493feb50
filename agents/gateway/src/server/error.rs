//! Mapping from the internal error taxonomy to the wire.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use smsgate_core::GatewayError;

/// Client-visible errors. Bodies are JSON `{"error": ...}` plus any
/// documented extras; stack traces never leave the process.
#[derive(Debug)]
pub enum ApiError {
    /// 401.
    Unauthorized,
    /// 400.
    BadRequest(String),
    /// 402 with the amount that was needed.
    InsufficientCredits {
        /// Cents the hold required.
        required_cents: i64,
    },
    /// 429 with a retry hint, also sent as `Retry-After`.
    RateLimited {
        /// Seconds until the next token.
        retry_after_seconds: u64,
    },
    /// 404.
    NotFound,
    /// 503.
    ServiceUnavailable(String),
    /// 500.
    Internal(String),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidRequest(msg) => Self::BadRequest(msg),
            GatewayError::InsufficientCredit { required_cents, .. } => {
                Self::InsufficientCredits { required_cents }
            }
            GatewayError::RateLimited {
                retry_after_seconds,
            } => Self::RateLimited {
                retry_after_seconds,
            },
            GatewayError::NotFound(_) => Self::NotFound,
            GatewayError::ProviderTemporary(msg) | GatewayError::ProviderPermanent(msg) => {
                Self::ServiceUnavailable(msg)
            }
            GatewayError::Timeout(what) => Self::ServiceUnavailable(format!("timed out: {what}")),
            // Everything else is an internal fault; details go to the log,
            // not the wire.
            other => {
                tracing::error!(error = %other, "Internal error surfaced to handler");
                Self::Internal("internal error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            Self::InsufficientCredits { required_cents } => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": "insufficient credits",
                    "required_cents": required_cents,
                })),
            )
                .into_response(),
            Self::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                Json(json!({
                    "error": "rate limited",
                    "retry_after_seconds": retry_after_seconds,
                })),
            )
                .into_response(),
            Self::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
            }
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": msg})),
            )
                .into_response(),
            Self::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": msg})),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gateway_errors_map_to_documented_statuses() {
        let cases: Vec<(GatewayError, StatusCode)> = vec![
            (
                GatewayError::InvalidRequest("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::InsufficientCredit {
                    required_cents: 5,
                    available_cents: 0,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                GatewayError::RateLimited {
                    retry_after_seconds: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (GatewayError::NotFound("message"), StatusCode::NOT_FOUND),
            (
                GatewayError::ProviderTemporary("no route".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Other("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn rate_limit_response_carries_retry_after_header() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 7,
        }
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "7"
        );
    }
}
