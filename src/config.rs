//! Configuration types for bulwark-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any port. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [rate_limits.free]
//! tokens_per_second = 1.0
//! max_tokens = 10
//!
//! [upstream_services.default]
//! base_url = "http://localhost:9000"
//! ```

use std::{collections::HashMap, path::Path, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Client tier — determines a client's token-bucket capacity and refill rate.
///
/// Unknown tier strings fall back to [`Tier::Free`] everywhere a tier is
/// resolved (rate limiter, admin `/clients` endpoints).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        })
    }
}

impl FromStr for Tier {
    type Err = std::convert::Infallible;

    /// Unknown strings (and any case variation of the four known tiers) parse
    /// to `Free` — callers never see a parse failure, only a possibly
    /// surprising default. This mirrors "Unknown tier falls back to FREE".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "basic" => Self::Basic,
            "premium" => Self::Premium,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        })
    }
}

/// Rate-limit parameters for one tier.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Token refill rate, tokens per second.
    pub tokens_per_second: f64,
    /// Maximum bucket capacity (also the initial token count for a new bucket).
    pub max_tokens: u32,
}

/// Token cost for requests whose path matches `path_pattern`.
///
/// `path_pattern` is matched anchored-at-start via [`anchored_match`], which
/// only accepts a match starting at offset 0 — mirroring Python's `re.match`
/// semantics used by the reference implementation, as opposed to
/// `Regex::is_match`, which would match anywhere in the path. Order is
/// significant: the first matching entry wins, so more specific patterns must
/// precede more general ones.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub path_pattern: String,
    #[serde(default = "defaults::token_cost")]
    pub token_cost: u32,
}

/// An explicit path-pattern → upstream-service routing rule.
///
/// Evaluated before the implicit per-service `^/api/<name>/.*` rule that the
/// router generates for every configured upstream service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub path_pattern: String,
    pub service: String,
}

/// Circuit-breaker + health-check configuration for one upstream service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamServiceConfig {
    pub base_url: String,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "defaults::recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    #[serde(default = "defaults::half_open_requests")]
    pub half_open_requests: u32,
    /// Path probed by the health checker. `None` disables health checking for
    /// this service (it is simply never included in a probe round).
    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default = "defaults::health_check_interval_secs")]
    pub health_check_interval_secs: f64,
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::client_id_header")]
    pub client_id_header: String,
    #[serde(default = "defaults::fallback_to_ip")]
    pub fallback_to_ip: bool,
    #[serde(default = "defaults::metrics_retention_seconds")]
    pub metrics_retention_seconds: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            client_id_header: defaults::client_id_header(),
            fallback_to_ip: defaults::fallback_to_ip(),
            metrics_retention_seconds: defaults::metrics_retention_seconds(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default = "defaults::rate_limits")]
    pub rate_limits: HashMap<Tier, RateLimitConfig>,

    #[serde(default = "defaults::endpoint_costs")]
    pub endpoint_costs: Vec<EndpointConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    pub upstream_services: HashMap<String, UpstreamServiceConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the three environment-variable overrides named in the gateway spec.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.gateway.port = port;
            }
        }
        if let Ok(header) = std::env::var("GATEWAY_CLIENT_ID_HEADER") {
            self.gateway.client_id_header = header;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.upstream_services.is_empty(),
            "at least one [upstream_services.*] entry is required"
        );

        for endpoint in &self.endpoint_costs {
            regex::Regex::new(&endpoint.path_pattern).with_context(|| {
                format!("invalid endpoint path_pattern `{}`", endpoint.path_pattern)
            })?;
            anyhow::ensure!(
                endpoint.token_cost >= 1,
                "endpoint `{}` has token_cost 0 — must be >= 1",
                endpoint.path_pattern
            );
        }

        for route in &self.routes {
            regex::Regex::new(&route.path_pattern)
                .with_context(|| format!("invalid route path_pattern `{}`", route.path_pattern))?;
            anyhow::ensure!(
                self.upstream_services.contains_key(&route.service),
                "route `{}` references unknown service `{}`",
                route.path_pattern,
                route.service
            );
        }

        for (name, svc) in &self.upstream_services {
            anyhow::ensure!(
                svc.failure_threshold >= 1,
                "service `{name}` failure_threshold must be >= 1"
            );
            anyhow::ensure!(
                svc.recovery_timeout_secs > 0.0,
                "service `{name}` recovery_timeout_secs must be > 0"
            );
            anyhow::ensure!(
                svc.half_open_requests >= 1,
                "service `{name}` half_open_requests must be >= 1"
            );
        }

        for (tier, cfg) in &self.rate_limits {
            anyhow::ensure!(
                cfg.tokens_per_second > 0.0,
                "rate_limits.{tier} tokens_per_second must be > 0"
            );
            anyhow::ensure!(
                cfg.max_tokens >= 1,
                "rate_limits.{tier} max_tokens must be >= 1"
            );
        }

        Ok(())
    }

    /// Rate-limit config for a tier, falling back to the built-in defaults
    /// table when a tier has no explicit `[rate_limits.*]` entry.
    pub fn rate_limit_for(&self, tier: Tier) -> RateLimitConfig {
        self.rate_limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| defaults::rate_limits()[&tier])
    }
}

/// `Regex::is_match` searches anywhere in the string; the reference
/// implementation uses Python's `re.match`, which anchors at the start.
/// `Regex::find` starting at offset 0 whose match begins at 0 reproduces that.
pub fn anchored_match(re: &regex::Regex, haystack: &str) -> bool {
    re.find(haystack).is_some_and(|m| m.start() == 0)
}

mod defaults {
    use std::collections::HashMap;

    use super::{EndpointConfig, RateLimitConfig, Tier};

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn port() -> u16 {
        8080
    }
    pub fn client_id_header() -> String {
        "X-API-Key".to_string()
    }
    pub fn fallback_to_ip() -> bool {
        true
    }
    pub fn metrics_retention_seconds() -> u64 {
        3600
    }
    pub fn timeout_ms() -> u64 {
        30_000
    }
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn recovery_timeout_secs() -> f64 {
        30.0
    }
    pub fn half_open_requests() -> u32 {
        3
    }
    pub fn health_check_interval_secs() -> f64 {
        30.0
    }
    pub fn token_cost() -> u32 {
        1
    }

    pub fn rate_limits() -> HashMap<Tier, RateLimitConfig> {
        let mut m = HashMap::new();
        m.insert(
            Tier::Free,
            RateLimitConfig { tokens_per_second: 1.0, max_tokens: 10 },
        );
        m.insert(
            Tier::Basic,
            RateLimitConfig { tokens_per_second: 5.0, max_tokens: 50 },
        );
        m.insert(
            Tier::Premium,
            RateLimitConfig { tokens_per_second: 20.0, max_tokens: 200 },
        );
        m.insert(
            Tier::Enterprise,
            RateLimitConfig { tokens_per_second: 100.0, max_tokens: 1000 },
        );
        m
    }

    pub fn endpoint_costs() -> Vec<EndpointConfig> {
        vec![
            EndpointConfig { path_pattern: r"^/api/v1/search.*".into(), token_cost: 5 },
            EndpointConfig { path_pattern: r"^/api/v1/export.*".into(), token_cost: 10 },
            EndpointConfig { path_pattern: r"^/api/v1/bulk.*".into(), token_cost: 20 },
            EndpointConfig { path_pattern: r"^/api/v1/.*".into(), token_cost: 1 },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [gateway]
            port = 8080

            [upstream_services.default]
            base_url = "http://localhost:9000"
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let config = minimal_config();
        assert_eq!(config.gateway.client_id_header, "X-API-Key");
        assert!(config.gateway.fallback_to_ip);
        assert_eq!(config.endpoint_costs.len(), 4);
        assert_eq!(config.rate_limit_for(Tier::Free).max_tokens, 10);
        assert_eq!(config.rate_limit_for(Tier::Enterprise).tokens_per_second, 100.0);
    }

    #[test]
    fn validation_rejects_empty_upstream_services() {
        let mut config = minimal_config();
        config.upstream_services.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_route_to_unknown_service() {
        let mut config = minimal_config();
        config.routes.push(RouteConfig {
            path_pattern: "^/api/x.*".into(),
            service: "nonexistent".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_invalid_regex() {
        let mut config = minimal_config();
        config.endpoint_costs.push(EndpointConfig {
            path_pattern: "[unclosed".into(),
            token_cost: 1,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn tier_unknown_string_falls_back_to_free() {
        assert_eq!("garbage".parse::<Tier>().unwrap(), Tier::Free);
        assert_eq!("PREMIUM".parse::<Tier>().unwrap(), Tier::Premium);
    }

    #[test]
    fn anchored_match_requires_match_at_start() {
        let re = regex::Regex::new(r"^/api/v1/.*").unwrap();
        assert!(anchored_match(&re, "/api/v1/foo"));
        assert!(!anchored_match(&re, "/prefix/api/v1/foo"));
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        let env_host = "GATEWAY_HOST";
        let env_port = "GATEWAY_PORT";
        unsafe {
            std::env::set_var(env_host, "127.0.0.1");
            std::env::set_var(env_port, "9999");
        }
        let mut config = minimal_config();
        config.apply_env_overrides();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 9999);
        unsafe {
            std::env::remove_var(env_host);
            std::env::remove_var(env_port);
        }
    }
}
