//! Unified error type for request handling.
//!
//! Most of the gateway's own errors carry enough meaning to pick a specific
//! HTTP status; anything else collapses to `anyhow::Error` and becomes a 500.
//! Rate limiting is handled inline in the pipeline (it needs to set
//! `Retry-After` and a JSON body shaped like `RateLimitResponse`) and never
//! flows through this type.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors that can surface while routing and proxying a request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route matches path `{0}`")]
    NoRouteFound(String),

    /// Carries the breaker's own rejection reason (e.g. "Circuit open, retry
    /// in 12.3s"), not just the service name — see `CircuitBreaker::can_execute`.
    #[error("{0}")]
    CircuitOpen(String),

    #[error("upstream `{service}` timed out")]
    UpstreamTimeout { service: String },

    #[error("could not connect to upstream `{service}`")]
    UpstreamConnection { service: String },

    #[error("upstream `{service}` error: {source}")]
    Upstream {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("gateway component unavailable: {0}")]
    InternalUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NoRouteFound(_) => StatusCode::NOT_FOUND,
            Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamConnection { .. } => StatusCode::BAD_GATEWAY,
            Self::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "unhandled gateway error");
        } else {
            tracing::warn!(error = %self, %status, "request failed");
        }
        let is_circuit_open = matches!(self, Self::CircuitOpen(_));
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if is_circuit_open {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
        }
        response
    }
}

/// Generic wrapper for admin-surface handlers that just need `?` to work with
/// `anyhow::Error`, without the full [`GatewayError`] taxonomy.
pub struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "unhandled admin error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
