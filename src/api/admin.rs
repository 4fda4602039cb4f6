//! Admin surface: health/readiness, metrics, circuit-breaker and rate-limit
//! introspection, and client tier management.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{config::Tier, error::AppError, state::AppState};

fn default_window_seconds() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_window_seconds")]
    window_seconds: u64,
}

/// `GET /health` — liveness. Always 200 once the process is up; reports the
/// background health checker's last-known status per service but never
/// fails the request on an unhealthy upstream (see `/ready` for that).
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let services: HashMap<String, &'static str> = state
        .health
        .all_statuses()
        .into_iter()
        .map(|(name, healthy)| (name, if healthy { "healthy" } else { "unhealthy" }))
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_seconds": state.metrics.uptime_seconds(),
            "services": services,
        })),
    )
}

/// `GET /ready` — readiness, reflecting the background health checker's most
/// recent probe of every service that has a `health_check_path` configured.
/// 503 if any checked service is currently unhealthy.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let all_healthy = state.health.all_statuses().iter().all(|(_, healthy)| *healthy);
    let status = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({ "status": if all_healthy { "ready" } else { "not_ready" } });
    (status, Json(body))
}

/// `GET /metrics` — aggregated request metrics over a window (default 300s).
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let aggregated = state.metrics.aggregated(query.window_seconds).await;
    Json(json!({
        "window_seconds": query.window_seconds,
        "uptime_seconds": state.metrics.uptime_seconds(),
        "total_requests": aggregated.total_requests,
        "successful": aggregated.successful,
        "failed": aggregated.failed,
        "error_count": aggregated.error_count,
        "rate_limited_count": aggregated.rate_limited_count,
        "avg_latency_ms": aggregated.avg_latency_ms,
        "requests_by_client": aggregated.requests_by_client,
        "requests_by_path": aggregated.requests_by_path,
        "requests_by_service": aggregated.requests_by_service,
        "errors_by_service": aggregated.errors_by_service,
        "rate_limit_hits_by_client": aggregated.rate_limit_hits_by_client,
    }))
}

/// `GET /metrics/latency?window_seconds=300` — fixed set of percentiles,
/// matching the admin surface's documented response shape.
pub async fn metrics_latency(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let p50_ms = state.metrics.percentile_latency(50.0, query.window_seconds).await;
    let p90_ms = state.metrics.percentile_latency(90.0, query.window_seconds).await;
    let p95_ms = state.metrics.percentile_latency(95.0, query.window_seconds).await;
    let p99_ms = state.metrics.percentile_latency(99.0, query.window_seconds).await;
    Json(json!({
        "p50_ms": p50_ms,
        "p90_ms": p90_ms,
        "p95_ms": p95_ms,
        "p99_ms": p99_ms,
        "window_seconds": query.window_seconds,
    }))
}

/// `GET /metrics/client/{client_id}`
pub async fn metrics_client(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let metrics = state.metrics.client_metrics(&client_id, query.window_seconds).await;
    Json(json!({
        "client_id": client_id,
        "window_seconds": query.window_seconds,
        "total_requests": metrics.total_requests,
        "error_count": metrics.error_count,
        "rate_limited_count": metrics.rate_limited_count,
        "avg_latency_ms": metrics.avg_latency_ms,
        "p50_latency_ms": metrics.p50_latency_ms,
        "p99_latency_ms": metrics.p99_latency_ms,
    }))
}

/// `GET /circuit-breakers` — current state of every breaker that has been
/// created so far (a breaker is created lazily on first proxied request to
/// its service, so a never-hit service won't appear here).
pub async fn circuit_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breakers: HashMap<String, serde_json::Value> = state
        .breakers
        .all()
        .into_iter()
        .map(|(service, breaker)| {
            let config = breaker.config();
            let value = json!({
                "service": service,
                "state": breaker.state(),
                "stats": breaker.stats(),
                "config": {
                    "failure_threshold": config.failure_threshold,
                    "recovery_timeout_secs": config.recovery_timeout.as_secs_f64(),
                    "half_open_requests": config.half_open_requests,
                },
            });
            (service, value)
        })
        .collect();
    Json(json!({ "circuit_breakers": breakers }))
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    service: Option<String>,
}

/// `POST /circuit-breakers/reset` — resets one service (if `?service=` is
/// given) or every registered breaker.
pub async fn reset_circuit_breakers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServiceQuery>,
) -> impl IntoResponse {
    match query.service {
        Some(service) => {
            if state.breakers.reset_one(&service) {
                (StatusCode::OK, Json(json!({ "reset": service }))).into_response()
            } else {
                (StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown service `{service}`") })))
                    .into_response()
            }
        }
        None => {
            state.breakers.reset_all();
            (StatusCode::OK, Json(json!({ "reset": "all" }))).into_response()
        }
    }
}

/// `GET /rate-limits/status/{client_id}`
pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    match state.limiter.status(&client_id) {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no bucket recorded for client `{client_id}`") })),
        )
            .into_response(),
    }
}

/// `POST /rate-limits/reset/{client_id}`
pub async fn rate_limit_reset(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    if state.limiter.reset(&client_id) {
        (StatusCode::OK, Json(json!({ "reset": client_id }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": format!("no bucket recorded for client `{client_id}`") })))
            .into_response()
    }
}

/// `GET /clients` — every client with a recorded tier assignment or an active
/// rate-limit bucket.
pub async fn list_clients(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut clients: HashMap<String, Tier> = state.tiers.list_clients().into_iter().collect();
    for status in state.limiter.all_clients() {
        clients.entry(status.client_id).or_insert(status.tier);
    }
    Json(json!({ "clients": clients }))
}

#[derive(Debug, Deserialize)]
pub struct SetTierQuery {
    pub tier: Tier,
}

/// `POST /clients/{client_id}/tier?tier={tier}`
pub async fn set_client_tier(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Query(query): Query<SetTierQuery>,
) -> Result<impl IntoResponse, AppError> {
    state.tiers.set_tier(&client_id, query.tier);
    state.limiter.set_tier(&client_id, query.tier);
    Ok(Json(json!({ "client_id": client_id, "tier": query.tier })))
}

/// `DELETE /clients/{client_id}`
pub async fn remove_client(State(state): State<Arc<AppState>>, Path(client_id): Path<String>) -> impl IntoResponse {
    let removed_tier = state.tiers.remove_client(&client_id);
    let removed_bucket = state.limiter.remove_client(&client_id);
    if removed_tier || removed_bucket {
        (StatusCode::OK, Json(json!({ "removed": client_id }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown client `{client_id}`") }))).into_response()
    }
}
