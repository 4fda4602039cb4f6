//! Shared application state, assembled once at startup and handed to every
//! handler and middleware layer as `Arc<AppState>`.

use std::{sync::Arc, time::Duration};

use crate::{
    circuit::CircuitBreakerRegistry, clients::ClientTierStore, config::Config, health::HealthChecker,
    limiter::RateLimiter, metrics::MetricsCollector, router::GatewayRouter,
};

/// Paths exempt from rate limiting and metrics recording, matched by prefix.
pub const EXEMPT_PATHS: &[&str] = &["/health", "/metrics", "/ready", "/_internal"];

pub fn is_exempt_path(path: &str) -> bool {
    EXEMPT_PATHS.iter().any(|exempt| path.starts_with(exempt))
}

pub struct AppState {
    pub config: Config,
    pub limiter: RateLimiter,
    pub tiers: ClientTierStore,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub router: GatewayRouter,
    pub metrics: MetricsCollector,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let router = GatewayRouter::new(&config, breakers.clone())?;
        let limiter = RateLimiter::new(config.rate_limits.clone());
        let metrics = MetricsCollector::new(Duration::from_secs(config.gateway.metrics_retention_seconds));
        let health = Arc::new(HealthChecker::new());

        Ok(Arc::new(Self {
            config,
            limiter,
            tiers: ClientTierStore::new(),
            breakers,
            router,
            metrics,
            health,
        }))
    }

    /// Resolve the client id for a request: configured header first, then the
    /// peer IP if `fallback_to_ip` is set, then the literal `"anonymous"`.
    pub fn client_id(&self, headers: &axum::http::HeaderMap, peer_ip: Option<std::net::IpAddr>) -> String {
        if let Some(value) = headers.get(&self.config.gateway.client_id_header) {
            if let Ok(s) = value.to_str() {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
        if self.config.gateway.fallback_to_ip {
            if let Some(ip) = peer_ip {
                return ip.to_string();
            }
        }
        "anonymous".to_string()
    }
}
