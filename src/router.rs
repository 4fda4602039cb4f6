//! Path-based routing and request proxying.
//!
//! `GatewayRouter` resolves a request path to an upstream service, runs the
//! call through that service's circuit breaker, and forwards the request
//! with hop-by-hop headers stripped. Bodies are fully buffered — there is no
//! streaming or SSE passthrough.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use regex::Regex;

use crate::{
    circuit::{BreakerConfig, CircuitBreakerRegistry},
    config::{anchored_match, Config},
    error::GatewayError,
};

/// Headers that must never be forwarded to (or echoed back from) an upstream,
/// because they describe the hop between gateway and client, not the
/// end-to-end request.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

struct UpstreamService {
    client: reqwest::Client,
    base_url: String,
    breaker_config: BreakerConfig,
}

pub struct GatewayRouter {
    services: HashMap<String, UpstreamService>,
    route_table: Vec<(Regex, String)>,
    endpoint_costs: Vec<(Regex, u32)>,
    breakers: Arc<CircuitBreakerRegistry>,
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayRouter {
    pub fn new(config: &Config, breakers: Arc<CircuitBreakerRegistry>) -> anyhow::Result<Self> {
        let mut services = HashMap::new();
        for (name, svc_cfg) in &config.upstream_services {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(svc_cfg.timeout_ms))
                .build()?;
            services.insert(
                name.clone(),
                UpstreamService {
                    client,
                    base_url: svc_cfg.base_url.trim_end_matches('/').to_string(),
                    breaker_config: BreakerConfig {
                        failure_threshold: svc_cfg.failure_threshold,
                        recovery_timeout: Duration::from_secs_f64(svc_cfg.recovery_timeout_secs),
                        half_open_requests: svc_cfg.half_open_requests,
                    },
                },
            );
        }

        let mut route_table = Vec::new();
        // Explicit [[routes]] entries take priority over the implicit
        // per-service rule generated below.
        for route in &config.routes {
            route_table.push((Regex::new(&route.path_pattern)?, route.service.clone()));
        }
        for name in config.upstream_services.keys() {
            let pattern = format!(r"^/api/{}/.*", regex::escape(name));
            route_table.push((Regex::new(&pattern)?, name.clone()));
        }

        let mut endpoint_costs = Vec::with_capacity(config.endpoint_costs.len());
        for endpoint in &config.endpoint_costs {
            endpoint_costs.push((Regex::new(&endpoint.path_pattern)?, endpoint.token_cost));
        }

        Ok(Self { services, route_table, endpoint_costs, breakers })
    }

    /// Token cost for a request path: first matching entry in the
    /// compiled-once endpoint-cost table wins, default cost 1 otherwise.
    pub fn token_cost(&self, path: &str) -> u32 {
        for (re, cost) in &self.endpoint_costs {
            if anchored_match(re, path) {
                return *cost;
            }
        }
        1
    }

    /// First matching rule wins; `None` when nothing matches and there is no
    /// `"default"` upstream service to fall back to.
    pub fn resolve_service(&self, path: &str) -> Option<&str> {
        for (re, service) in &self.route_table {
            if anchored_match(re, path) {
                return Some(service.as_str());
            }
        }
        if self.services.contains_key("default") {
            Some("default")
        } else {
            None
        }
    }

    pub async fn proxy(
        &self,
        service_name: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ProxyResponse, GatewayError> {
        let service = self
            .services
            .get(service_name)
            .ok_or_else(|| GatewayError::NoRouteFound(path_and_query.to_string()))?;

        let breaker = self.breakers.get_or_create(service_name, service.breaker_config);
        let (admitted, reason) = breaker.can_execute();
        if !admitted {
            return Err(GatewayError::CircuitOpen(reason.unwrap_or_else(|| "Circuit open".to_string())));
        }

        let url = format!("{}{}", service.base_url, path_and_query);
        let forwarded_headers = strip_hop_by_hop(headers);

        let result = service
            .client
            .request(method, &url)
            .headers(forwarded_headers)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                breaker.record_success();
                let status = response.status();
                let headers = strip_hop_by_hop(response.headers());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Upstream { service: service_name.to_string(), source: e.into() })?;
                Ok(ProxyResponse { status, headers, body })
            }
            Err(e) if e.is_timeout() => {
                breaker.record_failure();
                Err(GatewayError::UpstreamTimeout { service: service_name.to_string() })
            }
            Err(e) if e.is_connect() => {
                breaker.record_failure();
                Err(GatewayError::UpstreamConnection { service: service_name.to_string() })
            }
            Err(e) => {
                breaker.record_failure();
                Err(GatewayError::Upstream { service: service_name.to_string(), source: e.into() })
            }
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn health_check_targets(&self, config: &Config) -> Vec<(String, String, Duration)> {
        config
            .upstream_services
            .iter()
            .filter_map(|(name, cfg)| {
                let path = cfg.health_check_path.clone()?;
                let base = self.services.get(name)?.base_url.clone();
                Some((name.clone(), format!("{base}{path}"), Duration::from_secs_f64(cfg.health_check_interval_secs)))
            })
            .collect()
    }
}

/// A header name used only as a convenient constant for request-id plumbing
/// elsewhere in the pipeline.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServiceConfig;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn base_config(base_url: String) -> Config {
        let mut upstream_services = HashMap::new();
        upstream_services.insert(
            "default".to_string(),
            UpstreamServiceConfig {
                base_url,
                timeout_ms: 2000,
                failure_threshold: 2,
                recovery_timeout_secs: 1.0,
                half_open_requests: 1,
                health_check_path: Some("/health".to_string()),
                health_check_interval_secs: 30.0,
            },
        );
        Config {
            gateway: crate::config::GatewaySettings::default(),
            rate_limits: HashMap::new(),
            endpoint_costs: vec![],
            routes: vec![],
            upstream_services,
        }
    }

    #[test]
    fn token_cost_matches_first_pattern_in_order() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let mut config = base_config("http://localhost:1".to_string());
        config.endpoint_costs = vec![
            crate::config::EndpointConfig { path_pattern: r"^/api/v1/search.*".into(), token_cost: 5 },
            crate::config::EndpointConfig { path_pattern: r"^/api/v1/export.*".into(), token_cost: 10 },
            crate::config::EndpointConfig { path_pattern: r"^/api/v1/bulk.*".into(), token_cost: 20 },
            crate::config::EndpointConfig { path_pattern: r"^/api/v1/.*".into(), token_cost: 1 },
        ];
        let router = GatewayRouter::new(&config, breakers).unwrap();
        assert_eq!(router.token_cost("/api/v1/search/widgets"), 5);
        assert_eq!(router.token_cost("/api/v1/export/report"), 10);
        assert_eq!(router.token_cost("/api/v1/bulk/delete"), 20);
        assert_eq!(router.token_cost("/api/v1/widgets"), 1);
        assert_eq!(router.token_cost("/unrelated"), 1);
    }

    #[test]
    fn resolve_service_falls_back_to_default() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let config = base_config("http://localhost:1".to_string());
        let router = GatewayRouter::new(&config, breakers).unwrap();
        assert_eq!(router.resolve_service("/totally/unrelated"), Some("default"));
        assert_eq!(router.resolve_service("/api/default/widgets"), Some("default"));
    }

    #[tokio::test]
    async fn proxy_strips_hop_by_hop_and_forwards_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock_server)
            .await;

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let config = base_config(mock_server.uri());
        let router = GatewayRouter::new(&config, breakers).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("accept", "text/plain".parse().unwrap());

        let response = router
            .proxy("default", Method::GET, "/widgets", &headers, Bytes::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn upstream_5xx_response_is_not_a_breaker_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let config = base_config(mock_server.uri());
        let router = GatewayRouter::new(&config, breakers.clone()).unwrap();

        let headers = HeaderMap::new();
        for _ in 0..5 {
            let response = router
                .proxy("default", Method::GET, "/boom", &headers, Bytes::new())
                .await
                .unwrap();
            assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        }

        let breaker = breakers.get("default").unwrap();
        assert_eq!(breaker.state(), crate::circuit::CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_upstream() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fails"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let mut config = base_config(mock_server.uri());
        config.upstream_services.get_mut("default").unwrap().timeout_ms = 10;
        let router = GatewayRouter::new(&config, breakers).unwrap();

        let headers = HeaderMap::new();
        for _ in 0..2 {
            let _ = router.proxy("default", Method::GET, "/fails", &headers, Bytes::new()).await;
        }
        let result = router.proxy("default", Method::GET, "/fails", &headers, Bytes::new()).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
    }

    #[test]
    fn no_route_and_no_default_returns_none() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let mut upstream_services = HashMap::new();
        upstream_services.insert(
            "billing".to_string(),
            UpstreamServiceConfig {
                base_url: "http://localhost:1".to_string(),
                timeout_ms: 1000,
                failure_threshold: 5,
                recovery_timeout_secs: 30.0,
                half_open_requests: 3,
                health_check_path: None,
                health_check_interval_secs: 30.0,
            },
        );
        let config = Config {
            gateway: crate::config::GatewaySettings::default(),
            rate_limits: HashMap::new(),
            endpoint_costs: vec![],
            routes: vec![],
            upstream_services,
        };
        let router = GatewayRouter::new(&config, breakers).unwrap();
        assert_eq!(router.resolve_service("/unrelated"), None);
        assert_eq!(router.resolve_service("/api/billing/invoices"), Some("billing"));
    }
}
