//! The request pipeline: exempt-path bypass, rate limiting, and metrics
//! recording, composed into a single `axum::middleware::from_fn_with_state`
//! layer wrapping every route (admin surface and the proxy fallback alike).
//! Installed innermost (nearest the handler) so it sees the final request id
//! already assigned by `api::request_id`.
//!
//! Routing and proxying themselves are *not* done here — they're an ordinary
//! fallback handler (`api::proxy::proxy_handler`) that this middleware's
//! `next.run` dispatches into, exactly as the reference implementation's
//! rate-limit middleware calls `call_next()` and lets normal route dispatch
//! decide between an admin endpoint and the proxy catch-all.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    metrics::RequestMetric,
    state::{is_exempt_path, AppState},
};

pub async fn gateway_pipeline(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let path = request.uri().path().to_string();

    if is_exempt_path(&path) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let peer_ip = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let client_id = state.client_id(request.headers(), peer_ip);
    let tier = state.tiers.get_tier(&client_id);
    let token_cost = state.router.token_cost(&path);

    let remaining_tokens = match state.limiter.check(&client_id, tier, token_cost) {
        Ok(remaining) => remaining,
        Err(denied) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            state
                .metrics
                .record(RequestMetric {
                    client_id: client_id.clone(),
                    path: path.clone(),
                    method,
                    service: String::new(),
                    status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                    latency_ms,
                    rate_limited: true,
                    error: Some("rate limit exceeded".to_string()),
                    recorded_at: Instant::now(),
                })
                .await;
            tracing::warn!(client_id, path, latency_ms, rate_limited = true, "rate limit exceeded");

            let retry_after = denied.retry_after_secs.ceil() as u64 + 1;
            let now_epoch =
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
            let reset_at = (now_epoch + denied.retry_after_secs).floor() as u64;

            return (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    ("Retry-After", retry_after.to_string()),
                    ("X-RateLimit-Remaining", (denied.remaining.floor().max(0.0) as u64).to_string()),
                    ("X-RateLimit-Reset", reset_at.to_string()),
                ],
                Json(json!({
                    "error": "rate limit exceeded",
                    "retry_after_seconds": retry_after,
                    "remaining_tokens": denied.remaining,
                })),
            )
                .into_response();
        }
    };

    let mut response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    let service = response
        .extensions()
        .get::<crate::api::proxy::ProxiedService>()
        .map(|s| s.0.clone())
        .unwrap_or_default();
    let error = response.extensions().get::<crate::api::proxy::ProxyError>().map(|e| e.0.clone());

    if let Ok(value) = HeaderValue::from_str(&(remaining_tokens.floor().max(0.0) as u64).to_string()) {
        response.headers_mut().insert("X-RateLimit-Remaining", value);
    }

    state
        .metrics
        .record(RequestMetric {
            client_id: client_id.clone(),
            path: path.clone(),
            method,
            service: service.clone(),
            status,
            latency_ms,
            rate_limited: false,
            error,
            recorded_at: Instant::now(),
        })
        .await;

    tracing::info!(client_id, path, service, status, latency_ms, rate_limited = false, "request completed");

    response
}
