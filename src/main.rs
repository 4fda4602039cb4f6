mod api;
mod circuit;
mod clients;
mod config;
mod error;
mod health;
mod limiter;
mod metrics;
mod pipeline;
mod router;
mod state;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{config::Config, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--healthcheck") {
        std::process::exit(run_healthcheck_probe().await);
    }

    init_tracing();

    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./gateway.toml"));
    let config = Config::load(&config_path)?;
    tracing::info!(path = %config_path.display(), "loaded gateway config");

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;

    let state = AppState::new(config)?;
    let health_targets = state.router.health_check_targets(&state.config);
    state.health.clone().start(health_targets);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bulwark-gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::admin::health))
        .route("/ready", get(api::admin::ready))
        .route("/metrics", get(api::admin::metrics))
        .route("/metrics/latency", get(api::admin::metrics_latency))
        .route("/metrics/client/{client_id}", get(api::admin::metrics_client))
        .route("/circuit-breakers", get(api::admin::circuit_breakers))
        .route("/circuit-breakers/reset", post(api::admin::reset_circuit_breakers))
        .route("/rate-limits/status/{client_id}", get(api::admin::rate_limit_status))
        .route("/rate-limits/reset/{client_id}", post(api::admin::rate_limit_reset))
        .route("/clients", get(api::admin::list_clients))
        .route("/clients/{client_id}/tier", post(api::admin::set_client_tier))
        .route("/clients/{client_id}", delete(api::admin::remove_client))
        .fallback(api::proxy::proxy_handler)
        .layer(axum::middleware::from_fn_with_state(state.clone(), pipeline::gateway_pipeline))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bulwark_gateway=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Convenience path for `HEALTHCHECK` directives in container images: probe
/// our own `/health` endpoint and exit 0/1 without needing a separate curl
/// binary in the image.
async fn run_healthcheck_probe() -> i32 {
    let port = std::env::var("GATEWAY_PORT").ok().and_then(|p| p.parse::<u16>().ok()).unwrap_or(8080);
    let url = format!("http://127.0.0.1:{port}/health");
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => 0,
        _ => 1,
    }
}
