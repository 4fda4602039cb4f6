//! Append-only request metrics log with windowed aggregation.
//!
//! Unlike the teacher's `TrafficLog` (which uses `try_lock` and silently
//! drops entries under contention — fine for a best-effort traffic sample,
//! not fine here), `record` always awaits the lock: every non-exempt request
//! must produce exactly one metric.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestMetric {
    pub client_id: String,
    pub path: String,
    pub method: String,
    pub service: String,
    pub status: u16,
    pub latency_ms: u64,
    pub rate_limited: bool,
    pub error: Option<String>,
    #[serde(skip)]
    pub recorded_at: Instant,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AggregatedMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub error_count: u64,
    pub rate_limited_count: u64,
    pub avg_latency_ms: f64,
    pub requests_by_client: HashMap<String, u64>,
    pub requests_by_path: HashMap<String, u64>,
    pub requests_by_service: HashMap<String, u64>,
    pub errors_by_service: HashMap<String, u64>,
    pub rate_limit_hits_by_client: HashMap<String, u64>,
}

/// Metrics scoped to a single client, with the reference implementation's
/// client-specific error threshold (`status >= 400`, not `>= 500`) and
/// latency percentiles.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub error_count: u64,
    pub rate_limited_count: u64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: Option<u64>,
    pub p99_latency_ms: Option<u64>,
}

pub struct MetricsCollector {
    log: Mutex<Vec<RequestMetric>>,
    retention: Duration,
    started_at: Instant,
    append_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new(retention: Duration) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            retention,
            started_at: Instant::now(),
            append_count: AtomicU64::new(0),
        }
    }

    /// Record one request's outcome. Runs a retention sweep every 1000
    /// appends so the log doesn't grow unbounded under sustained traffic.
    pub async fn record(&self, metric: RequestMetric) {
        let mut log = self.log.lock().await;
        log.push(metric);

        let count = self.append_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 1000 == 0 {
            let cutoff = Instant::now().checked_sub(self.retention).unwrap_or(self.started_at);
            log.retain(|m| m.recorded_at >= cutoff);
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    async fn window(&self, window_seconds: u64) -> Vec<RequestMetric> {
        let log = self.log.lock().await;
        let cutoff = Instant::now()
            .checked_sub(Duration::from_secs(window_seconds))
            .unwrap_or(self.started_at);
        log.iter().filter(|m| m.recorded_at >= cutoff).cloned().collect()
    }

    pub async fn aggregated(&self, window_seconds: u64) -> AggregatedMetrics {
        let entries = self.window(window_seconds).await;
        let total_requests = entries.len() as u64;
        let error_count = entries.iter().filter(|m| m.status >= 500).count() as u64;
        let rate_limited_count = entries.iter().filter(|m| m.rate_limited).count() as u64;
        let successful = entries.iter().filter(|m| (200..400).contains(&m.status)).count() as u64;
        let failed = total_requests - successful;
        let avg_latency_ms = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|m| m.latency_ms).sum::<u64>() as f64 / entries.len() as f64
        };

        let mut requests_by_client = HashMap::new();
        let mut requests_by_path = HashMap::new();
        let mut requests_by_service = HashMap::new();
        let mut errors_by_service = HashMap::new();
        let mut rate_limit_hits_by_client = HashMap::new();

        for m in &entries {
            *requests_by_client.entry(m.client_id.clone()).or_insert(0u64) += 1;
            *requests_by_path.entry(m.path.clone()).or_insert(0u64) += 1;
            if !m.service.is_empty() {
                *requests_by_service.entry(m.service.clone()).or_insert(0u64) += 1;
                if m.status >= 500 || m.error.is_some() {
                    *errors_by_service.entry(m.service.clone()).or_insert(0u64) += 1;
                }
            }
            if m.rate_limited {
                *rate_limit_hits_by_client.entry(m.client_id.clone()).or_insert(0u64) += 1;
            }
        }

        AggregatedMetrics {
            total_requests,
            successful,
            failed,
            error_count,
            rate_limited_count,
            avg_latency_ms,
            requests_by_client,
            requests_by_path,
            requests_by_service,
            errors_by_service,
            rate_limit_hits_by_client,
        }
    }

    /// Percentile latency over the window, `percentile` in `[0, 100]`.
    /// `index = min(floor(n * p / 100), n - 1)` on the ascending-sorted
    /// latencies, matching the reference implementation exactly.
    pub async fn percentile_latency(&self, percentile: f64, window_seconds: u64) -> Option<u64> {
        let mut latencies: Vec<u64> =
            self.window(window_seconds).await.into_iter().map(|m| m.latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let n = latencies.len();
        let index = ((n as f64 * percentile / 100.0).floor() as usize).min(n - 1);
        Some(latencies[index])
    }

    pub async fn client_metrics(&self, client_id: &str, window_seconds: u64) -> ClientMetrics {
        let entries: Vec<RequestMetric> = self
            .window(window_seconds)
            .await
            .into_iter()
            .filter(|m| m.client_id == client_id)
            .collect();
        let total_requests = entries.len() as u64;
        let error_count = entries.iter().filter(|m| m.status >= 400).count() as u64;
        let rate_limited_count = entries.iter().filter(|m| m.rate_limited).count() as u64;
        let avg_latency_ms = if entries.is_empty() {
            0.0
        } else {
            entries.iter().map(|m| m.latency_ms).sum::<u64>() as f64 / entries.len() as f64
        };

        let mut latencies: Vec<u64> = entries.iter().map(|m| m.latency_ms).collect();
        latencies.sort_unstable();
        let n = latencies.len();
        let (p50_latency_ms, p99_latency_ms) = if n == 0 {
            (None, None)
        } else {
            (Some(latencies[n / 2]), Some(latencies[((n as f64) * 0.99) as usize]))
        };

        ClientMetrics { total_requests, error_count, rate_limited_count, avg_latency_ms, p50_latency_ms, p99_latency_ms }
    }
}
