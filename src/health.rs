//! Background health checker.
//!
//! Independent of the circuit breaker: a service can be circuit-open (too
//! many failed *proxied* calls) while still answering its health-check path,
//! and vice versa. One loop per gateway instance, not per service — each
//! round fans probes out to `tokio::spawn`ed tasks and joins them, since the
//! dependency set carries `tokio` but not the `futures` crate.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;

pub struct HealthChecker {
    client: reqwest::Client,
    status: Arc<DashMap<String, bool>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("health-check client builds with defaults"),
            status: Arc::new(DashMap::new()),
        }
    }

    pub fn status(&self) -> Arc<DashMap<String, bool>> {
        self.status.clone()
    }

    pub fn is_healthy(&self, service: &str) -> Option<bool> {
        self.status.get(service).map(|entry| *entry)
    }

    pub fn all_statuses(&self) -> Vec<(String, bool)> {
        self.status.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }

    /// Spawn the background loop. `targets` is `(service_name, probe_url,
    /// interval)`; the loop round period is the minimum interval across all
    /// targets (30s if there are none), matching the reference
    /// implementation's single shared sleep.
    pub fn start(self: Arc<Self>, targets: Vec<(String, String, Duration)>) -> tokio::task::JoinHandle<()> {
        let round_interval = targets
            .iter()
            .map(|(_, _, interval)| *interval)
            .min()
            .unwrap_or(Duration::from_secs(30));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(round_interval);
            loop {
                ticker.tick().await;
                self.check_all(&targets).await;
            }
        })
    }

    async fn check_all(&self, targets: &[(String, String, Duration)]) {
        let mut handles = Vec::with_capacity(targets.len());
        for (name, url, _) in targets {
            let client = self.client.clone();
            let name = name.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                let healthy = client
                    .get(&url)
                    .send()
                    .await
                    .map(|resp| resp.status().is_success())
                    .unwrap_or(false);
                (name, healthy)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((name, healthy)) => {
                    self.status.insert(name, healthy);
                }
                Err(e) => tracing::warn!(error = %e, "health probe task panicked"),
            }
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers::path, Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn check_all_records_success_and_failure() {
        let healthy_server = MockServer::start().await;
        Mock::given(path("/health")).respond_with(ResponseTemplate::new(200)).mount(&healthy_server).await;

        let checker = HealthChecker::new();
        let targets = vec![
            ("up".to_string(), format!("{}/health", healthy_server.uri()), Duration::from_secs(30)),
            ("down".to_string(), "http://127.0.0.1:1/health".to_string(), Duration::from_secs(30)),
        ];
        checker.check_all(&targets).await;

        assert_eq!(checker.is_healthy("up"), Some(true));
        assert_eq!(checker.is_healthy("down"), Some(false));
    }

    #[tokio::test]
    async fn unknown_service_has_no_recorded_status() {
        let checker = HealthChecker::new();
        assert_eq!(checker.is_healthy("never-checked"), None);
    }
}
