//! Per-client token-bucket rate limiter.
//!
//! One bucket per client id, all buckets and tier assignments guarded by a
//! single synchronous mutex. The refill+consume step never suspends, so a
//! `std::sync::Mutex` is used deliberately instead of `tokio::sync::Mutex` —
//! there is no `.await` anywhere between acquiring the lock and releasing it.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use crate::config::{RateLimitConfig, Tier};

/// A single client's bucket. `tokens` is fractional to avoid rounding a slow
/// trickle of refill down to zero forever.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(cfg: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: cfg.max_tokens as f64,
            max_tokens: cfg.max_tokens as f64,
            tokens_per_second: cfg.tokens_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tokens_per_second).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Refill based on elapsed monotonic time, then try to consume `cost`
    /// tokens. Returns `Ok(remaining)` on success, `Err((retry_after_secs,
    /// remaining))` when there aren't enough tokens — `remaining` is the
    /// (refilled, unconsumed) balance at the moment of rejection.
    fn consume(&mut self, cost: u32, now: Instant) -> Result<f64, (f64, f64)> {
        self.refill(now);

        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(self.tokens)
        } else {
            let deficit = cost - self.tokens;
            let retry_after = if self.tokens_per_second > 0.0 {
                deficit / self.tokens_per_second
            } else {
                f64::INFINITY
            };
            Err((retry_after, self.tokens))
        }
    }

    fn reconfigure(&mut self, cfg: RateLimitConfig) {
        // Preserve the existing fill level but never exceed the new cap.
        self.tokens = self.tokens.min(cfg.max_tokens as f64);
        self.max_tokens = cfg.max_tokens as f64;
        self.tokens_per_second = cfg.tokens_per_second;
    }
}

/// Snapshot of a client's current bucket state, used by the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientStatus {
    pub client_id: String,
    pub tier: Tier,
    pub available_tokens: f64,
    pub max_tokens: f64,
    /// The bucket's own current refill rate (tokens/sec).
    pub refill_rate: f64,
    /// The rate configured for the client's current tier — normally equal to
    /// `refill_rate`, but surfaced separately to match the admin response
    /// shape (they can diverge for one tick if a tier change and a status
    /// read race, since `refill_rate` reflects the bucket as last touched).
    pub tokens_per_second: f64,
}

/// Outcome of a rate-limit check that was denied.
#[derive(Debug, Clone, Copy)]
pub struct Denied {
    pub retry_after_secs: f64,
    pub remaining: f64,
}

struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    tiers: HashMap<String, Tier>,
}

pub struct RateLimiter {
    state: Mutex<LimiterState>,
    tier_configs: HashMap<Tier, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(tier_configs: HashMap<Tier, RateLimitConfig>) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                tiers: HashMap::new(),
            }),
            tier_configs,
        }
    }

    fn config_for(&self, tier: Tier) -> RateLimitConfig {
        self.tier_configs
            .get(&tier)
            .copied()
            .unwrap_or(RateLimitConfig { tokens_per_second: 1.0, max_tokens: 10 })
    }

    /// Check and, on success, consume `cost` tokens for `client_id`. `tier` is
    /// the client's *current* tier as resolved by the caller (e.g. from an API
    /// key lookup) — if it differs from a previously recorded tier, the
    /// client's bucket is reconfigured in place rather than reset from
    /// scratch, so an in-flight deficit carries over.
    pub fn check(&self, client_id: &str, tier: Tier, cost: u32) -> Result<f64, Denied> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");

        let recorded_tier = state.tiers.get(client_id).copied();
        if recorded_tier != Some(tier) {
            state.tiers.insert(client_id.to_string(), tier);
            let cfg = self.config_for(tier);
            match state.buckets.get_mut(client_id) {
                Some(bucket) => bucket.reconfigure(cfg),
                None => {
                    state.buckets.insert(client_id.to_string(), TokenBucket::new(cfg, now));
                }
            }
        }

        let bucket = state
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.config_for(tier), now));

        bucket
            .consume(cost, now)
            .map_err(|(retry_after_secs, remaining)| Denied { retry_after_secs, remaining })
    }

    pub fn status(&self, client_id: &str) -> Option<ClientStatus> {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let tier = state.tiers.get(client_id).copied().unwrap_or_default();
        let tokens_per_second = self.config_for(tier).tokens_per_second;
        let bucket = state.buckets.get_mut(client_id)?;
        bucket.refill(Instant::now());
        Some(ClientStatus {
            client_id: client_id.to_string(),
            tier,
            available_tokens: bucket.tokens,
            max_tokens: bucket.max_tokens,
            refill_rate: bucket.tokens_per_second,
            tokens_per_second,
        })
    }

    pub fn reset(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let tier = state.tiers.get(client_id).copied().unwrap_or_default();
        let cfg = self.config_for(tier);
        match state.buckets.get_mut(client_id) {
            Some(bucket) => {
                bucket.tokens = cfg.max_tokens as f64;
                bucket.last_refill = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove_client(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let removed_bucket = state.buckets.remove(client_id).is_some();
        state.tiers.remove(client_id);
        removed_bucket
    }

    pub fn all_clients(&self) -> Vec<ClientStatus> {
        let state = self.state.lock().expect("rate limiter mutex poisoned");
        state
            .buckets
            .iter()
            .map(|(client_id, bucket)| {
                let tier = state.tiers.get(client_id).copied().unwrap_or_default();
                ClientStatus {
                    client_id: client_id.clone(),
                    tier,
                    available_tokens: bucket.tokens,
                    max_tokens: bucket.max_tokens,
                    refill_rate: bucket.tokens_per_second,
                    tokens_per_second: self.config_for(tier).tokens_per_second,
                }
            })
            .collect()
    }

    pub fn set_tier(&self, client_id: &str, tier: Tier) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.tiers.insert(client_id.to_string(), tier);
        let cfg = self.config_for(tier);
        match state.buckets.get_mut(client_id) {
            Some(bucket) => bucket.reconfigure(cfg),
            None => {
                state
                    .buckets
                    .insert(client_id.to_string(), TokenBucket::new(cfg, Instant::now()));
            }
        }
    }

    /// Evict buckets that haven't been touched (refilled/consumed) in more
    /// than `max_idle_seconds`. Returns the number of clients removed.
    pub fn cleanup_inactive(&self, max_idle_seconds: f64) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let to_remove: Vec<String> = state
            .buckets
            .iter()
            .filter(|(_, bucket)| now.saturating_duration_since(bucket.last_refill).as_secs_f64() > max_idle_seconds)
            .map(|(client_id, _)| client_id.clone())
            .collect();

        for client_id in &to_remove {
            state.buckets.remove(client_id);
            state.tiers.remove(client_id);
        }

        to_remove.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread::sleep, time::Duration};

    fn limiter() -> RateLimiter {
        let mut cfgs = HashMap::new();
        cfgs.insert(Tier::Free, RateLimitConfig { tokens_per_second: 10.0, max_tokens: 5 });
        RateLimiter::new(cfgs)
    }

    #[test]
    fn consumes_tokens_up_to_capacity() {
        let limiter = limiter();
        for _ in 0..5 {
            assert!(limiter.check("alice", Tier::Free, 1).is_ok());
        }
        assert!(limiter.check("alice", Tier::Free, 1).is_err());
    }

    #[test]
    fn denied_reports_retry_after_and_remaining() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("bob", Tier::Free, 1).unwrap();
        }
        let denied = limiter.check("bob", Tier::Free, 1).unwrap_err();
        assert!(denied.retry_after_secs > 0.0);
        assert!(denied.remaining < 1.0);
    }

    #[test]
    fn refills_over_time() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("carol", Tier::Free, 1).unwrap();
        }
        sleep(Duration::from_millis(150));
        // 10 tokens/sec * 0.15s = ~1.5 tokens refilled
        assert!(limiter.check("carol", Tier::Free, 1).is_ok());
    }

    #[test]
    fn independent_clients_have_independent_buckets() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("dave", Tier::Free, 1).unwrap();
        }
        assert!(limiter.check("erin", Tier::Free, 1).is_ok());
    }

    #[test]
    fn reset_restores_full_capacity() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("frank", Tier::Free, 1).unwrap();
        }
        assert!(limiter.reset("frank"));
        assert!(limiter.check("frank", Tier::Free, 1).is_ok());
    }

    #[test]
    fn reset_unknown_client_returns_false() {
        let limiter = limiter();
        assert!(!limiter.reset("nobody"));
    }

    #[test]
    fn cost_greater_than_one_consumes_multiple_tokens() {
        let limiter = limiter();
        assert!(limiter.check("gina", Tier::Free, 3).is_ok());
        assert!(limiter.check("gina", Tier::Free, 3).is_err());
        assert!(limiter.check("gina", Tier::Free, 2).is_ok());
    }

    #[test]
    fn status_reports_refill_rate_and_tokens_per_second() {
        let limiter = limiter();
        limiter.check("holly", Tier::Free, 1).unwrap();
        let status = limiter.status("holly").unwrap();
        assert_eq!(status.refill_rate, 10.0);
        assert_eq!(status.tokens_per_second, 10.0);
    }

    #[test]
    fn cleanup_inactive_evicts_only_idle_clients() {
        let limiter = limiter();
        limiter.check("idle", Tier::Free, 1).unwrap();
        sleep(Duration::from_millis(60));
        limiter.check("active", Tier::Free, 1).unwrap();

        let removed = limiter.cleanup_inactive(0.03);
        assert_eq!(removed, 1);
        assert!(limiter.status("idle").is_none());
        assert!(limiter.status("active").is_some());
    }

    #[test]
    fn cleanup_inactive_returns_zero_when_nothing_idle() {
        let limiter = limiter();
        limiter.check("fresh", Tier::Free, 1).unwrap();
        assert_eq!(limiter.cleanup_inactive(3600.0), 0);
    }
}
