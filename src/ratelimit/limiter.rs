//! Core rate limiter implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace};

use super::adaptive::AdaptiveController;
use super::clock::{Clock, SystemClock};
use super::key::{RateLimitKey, RequestDescriptor};
use super::policy::{Policy, PolicyTable};
use super::store::{RateLimitStore, StoreStats, Sweeper};
use crate::config::RateLimitingConfig;
use crate::error::{GuardError, RateLimitExceeded, Result};

/// The values sent back as `X-RateLimit-*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// ISO-8601 reset time
    pub reset: String,
    /// Operation class as requested by the route
    pub class: String,
}

impl RateLimitHeaders {
    pub const LIMIT: &'static str = "x-ratelimit-limit";
    pub const REMAINING: &'static str = "x-ratelimit-remaining";
    pub const RESET: &'static str = "x-ratelimit-reset";
    pub const TYPE: &'static str = "x-ratelimit-type";

    /// Header name / value pairs.
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (Self::LIMIT, self.limit.to_string()),
            (Self::REMAINING, self.remaining.to_string()),
            (Self::RESET, self.reset.clone()),
            (Self::TYPE, self.class.clone()),
        ]
    }
}

/// Verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        headers: RateLimitHeaders,
        /// Store key the request was recorded under
        key: String,
        /// Timestamp recorded for the request
        recorded_at: u64,
        /// The policy wants the slot back if the response succeeds
        skip_successful: bool,
    },
    Denied {
        headers: RateLimitHeaders,
        error: RateLimitExceeded,
    },
    /// The limiter failed internally and `fail_open` let the request through
    Bypassed,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Decision::Allowed { headers, .. } | Decision::Denied { headers, .. } => Some(headers),
            Decision::Bypassed => None,
        }
    }
}

/// Payload for health and monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitHealth {
    pub stats: StoreStats,
    pub limits: BTreeMap<String, Policy>,
    pub timestamp: String,
}

/// The decision engine tying the store, policies and load shedding together.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    store: Arc<RateLimitStore>,
    policies: Arc<PolicyTable>,
    adaptive: AdaptiveController,
    clock: Arc<dyn Clock>,
    fail_open: bool,
    sweep_interval: Duration,
    stale_after_ms: u64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        let config = RateLimitingConfig::default();
        let policies = Arc::new(PolicyTable::default());
        Self::build(&config, policies, Arc::new(SystemClock))
    }

    /// Create a rate limiter from configuration.
    pub fn with_config(config: &RateLimitingConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter from configuration with a custom clock.
    pub fn with_clock(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let policies = Arc::new(PolicyTable::new(config.policies.clone())?);
        Ok(Self::build(config, policies, clock))
    }

    fn build(config: &RateLimitingConfig, policies: Arc<PolicyTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(RateLimitStore::with_penalty(config.penalty_ms())),
            adaptive: AdaptiveController::new(policies.clone(), config.adaptive.clone()),
            policies,
            clock,
            fail_open: config.fail_open,
            sweep_interval: config.sweep_interval(),
            stale_after_ms: config.stale_after_ms(),
            sweeper: Mutex::new(None),
        }
    }

    /// Check the rate limit for a request under an operation class.
    ///
    /// Internal failures are logged and turned into [`Decision::Bypassed`]
    /// when `fail_open` is set, and returned otherwise.
    pub fn check(&self, request: &RequestDescriptor, class: &str) -> Result<Decision> {
        match self.evaluate(request, class) {
            Ok(decision) => Ok(decision),
            Err(e) if self.fail_open => {
                error!(error = %e, class = %class, "Error in rate limiting, allowing request");
                Ok(Decision::Bypassed)
            }
            Err(e) => Err(e),
        }
    }

    fn evaluate(&self, request: &RequestDescriptor, class: &str) -> Result<Decision> {
        let resolved = self.policies.get(class);
        let policy = resolved.policy;
        let key = RateLimitKey::for_policy(request, &resolved).to_string_key();
        let now = self.clock.now_ms()?;

        trace!(key = %key, class = %class, "Checking rate limit");

        let window = self
            .store
            .evaluate(&key, policy.max_requests, policy.window_ms, now);

        let headers = RateLimitHeaders {
            limit: policy.max_requests,
            remaining: window.remaining_requests,
            reset: iso_timestamp(window.reset_time)?,
            class: class.to_string(),
        };

        if !window.allowed {
            let reset_in = window.reset_time.saturating_sub(now).div_ceil(1000);
            debug!(
                key = %key,
                limit = policy.max_requests,
                reset_in = reset_in,
                "Rate limit exceeded"
            );
            return Ok(Decision::Denied {
                headers,
                error: RateLimitExceeded::new(policy.max_requests, policy.window_ms, reset_in, class),
            });
        }

        Ok(Decision::Allowed {
            headers,
            key,
            recorded_at: now,
            skip_successful: policy.skip_successful_requests,
        })
    }

    /// Give back a slot recorded by an allowed decision.
    pub fn release(&self, key: &str, recorded_at: u64) -> bool {
        self.store.release(key, recorded_at)
    }

    /// Feed the current key count to the adaptive controller.
    pub fn observe_load(&self) -> bool {
        self.adaptive.observe(self.store.len())
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Stats, current limits and a timestamp.
    pub fn health(&self) -> Result<RateLimitHealth> {
        Ok(RateLimitHealth {
            stats: self.store.stats(),
            limits: self.policies.snapshot(),
            timestamp: iso_timestamp(self.clock.now_ms()?)?,
        })
    }

    /// Clear one key. Returns whether it was tracked.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.store.reset(key);
        info!(key = %key, removed = removed, "Rate limit reset");
        removed
    }

    /// Clear every key. Returns how many were tracked.
    pub fn reset_all(&self) -> usize {
        let count = self.store.len();
        self.store.reset_all();
        info!(cleared = count, "All rate limits reset");
        count
    }

    /// Recorded requests for `key`, if tracked.
    pub fn request_count(&self, key: &str) -> Option<usize> {
        self.store.request_count(key)
    }

    /// Start the periodic sweep. Calling it twice has no effect.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(Sweeper::is_running) {
            return;
        }
        *sweeper = Some(Sweeper::spawn(
            self.store.clone(),
            self.clock.clone(),
            self.sweep_interval,
            self.stale_after_ms,
        ));
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            stale_after_ms = self.stale_after_ms,
            "Rate limit sweeper started"
        );
    }

    /// Stop background tasks: the sweeper and any pending restore.
    pub fn shutdown(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.adaptive.shutdown();
        info!("Rate limiter stopped");
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.lock().as_ref().is_some_and(Sweeper::is_running)
    }

    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    pub fn adaptive(&self) -> &AdaptiveController {
        &self.adaptive
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format milliseconds since epoch like `2024-05-01T12:00:00.000Z`.
fn iso_timestamp(ms: u64) -> Result<String> {
    let millis = i64::try_from(ms).map_err(|e| GuardError::Clock(e.to_string()))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| GuardError::Clock(format!("timestamp {} out of range", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::DEFAULT_PENALTY_MS;

    struct BrokenClock;

    impl Clock for BrokenClock {
        fn now_ms(&self) -> Result<u64> {
            Err(GuardError::Clock("clock went backwards".to_string()))
        }
    }

    fn config_with(class: &str, policy: Policy) -> RateLimitingConfig {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(class.to_string(), policy);
        config
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor {
            forwarded_ip: Some("198.51.100.3".to_string()),
            user_id: Some("7".to_string()),
            ..Default::default()
        }
    }

    fn remaining(decision: &Decision) -> u64 {
        decision.headers().unwrap().remaining
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.stats().total_keys, 0);
        assert!(limiter.fail_open());
    }

    #[test]
    fn test_window_then_penalty() {
        let clock = Arc::new(ManualClock::new(0));
        let config = config_with("order_create", Policy::new(3, 1000));
        let limiter = RateLimiter::with_clock(&config, clock.clone()).unwrap();
        let req = request();

        for (t, left) in [(0, 2), (100, 1), (200, 0)] {
            clock.set(t);
            let d = limiter.check(&req, "order_create").unwrap();
            assert!(d.is_allowed());
            assert_eq!(remaining(&d), left);
        }

        clock.set(300);
        let denied = limiter.check(&req, "order_create").unwrap();
        let Decision::Denied { headers, error } = denied else {
            panic!("expected denial");
        };
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.limit, 3);
        assert_eq!(headers.class, "order_create");
        assert_eq!(error.reset_in, DEFAULT_PENALTY_MS / 1000);
        assert_eq!(error.limit, 3);
        assert_eq!(error.window_ms, 1000);

        clock.set(500);
        let Decision::Denied { headers: later, .. } = limiter.check(&req, "order_create").unwrap() else {
            panic!("expected denial");
        };
        assert_eq!(later.reset, headers.reset);
    }

    #[test]
    fn test_reset_in_rounds_up() {
        let clock = Arc::new(ManualClock::new(0));
        let config = config_with("order_read", Policy::new(1, 1000));
        let limiter = RateLimiter::with_clock(&config, clock.clone()).unwrap();
        let req = request();

        limiter.check(&req, "order_read").unwrap();
        clock.set(10);
        limiter.check(&req, "order_read").unwrap();
        clock.set(1_510);

        let Decision::Denied { error, .. } = limiter.check(&req, "order_read").unwrap() else {
            panic!("expected denial");
        };
        // 900_010 - 1_510 = 898_500ms
        assert_eq!(error.reset_in, 899);
    }

    #[test]
    fn test_reset_header_is_iso8601() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::with_clock(&RateLimitingConfig::default(), clock).unwrap();
        let d = limiter.check(&request(), "general").unwrap();
        // general window is 60s
        assert_eq!(d.headers().unwrap().reset, "2023-11-14T22:14:20.000Z");
    }

    #[test]
    fn test_unknown_class_uses_general_limits() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(&RateLimitingConfig::default(), clock).unwrap();
        let d = limiter.check(&request(), "checkout").unwrap();
        let headers = d.headers().unwrap();
        assert_eq!(headers.limit, 10_000);
        assert_eq!(headers.class, "checkout");
    }

    #[test]
    fn test_custom_class_does_not_share_general_window() {
        let clock = Arc::new(ManualClock::new(0));
        let config = config_with("checkout", Policy::new(1, 60_000));
        let limiter = RateLimiter::with_clock(&config, clock).unwrap();
        let req = request();

        assert!(limiter.check(&req, "general").unwrap().is_allowed());
        assert!(limiter.check(&req, "checkout").unwrap().is_allowed());
        assert!(!limiter.check(&req, "checkout").unwrap().is_allowed());
        assert!(limiter.check(&req, "general").unwrap().is_allowed());

        assert_eq!(limiter.stats().total_keys, 2);
        assert_eq!(limiter.request_count("checkout:198.51.100.3:7"), Some(1));
    }

    #[test]
    fn test_classes_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = config_with("order_create", Policy::new(1, 1000));
        config.policies.insert("order_read".to_string(), Policy::new(1, 1000));
        let limiter = RateLimiter::with_clock(&config, clock).unwrap();
        let req = request();

        assert!(limiter.check(&req, "order_create").unwrap().is_allowed());
        assert!(!limiter.check(&req, "order_create").unwrap().is_allowed());
        assert!(limiter.check(&req, "order_read").unwrap().is_allowed());
    }

    #[test]
    fn test_fail_open_bypasses_on_clock_error() {
        let limiter = RateLimiter::with_clock(&RateLimitingConfig::default(), Arc::new(BrokenClock)).unwrap();
        let d = limiter.check(&request(), "general").unwrap();
        assert_eq!(d, Decision::Bypassed);
        assert!(d.is_allowed());
        assert_eq!(limiter.stats().total_keys, 0);
    }

    #[test]
    fn test_fail_closed_returns_error() {
        let config = RateLimitingConfig {
            fail_open: false,
            ..RateLimitingConfig::default()
        };
        let limiter = RateLimiter::with_clock(&config, Arc::new(BrokenClock)).unwrap();
        assert!(matches!(limiter.check(&request(), "general"), Err(GuardError::Clock(_))));
    }

    #[test]
    fn test_release_returns_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let policy = Policy {
            skip_successful_requests: true,
            ..Policy::new(1, 1000)
        };
        let limiter = RateLimiter::with_clock(&config_with("file_upload", policy), clock).unwrap();
        let req = request();

        let Decision::Allowed { key, recorded_at, skip_successful, .. } =
            limiter.check(&req, "file_upload").unwrap()
        else {
            panic!("expected allow");
        };
        assert!(skip_successful);
        assert!(limiter.release(&key, recorded_at));
        assert!(limiter.check(&req, "file_upload").unwrap().is_allowed());
    }

    #[test]
    fn test_health_payload() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(&RateLimitingConfig::default(), clock).unwrap();
        limiter.check(&request(), "general").unwrap();

        let health = limiter.health().unwrap();
        assert_eq!(health.stats.total_keys, 1);
        assert_eq!(health.limits.len(), 6);
        assert_eq!(health.timestamp, "1970-01-01T00:00:00.000Z");

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["stats"]["totalKeys"], 1);
        assert_eq!(json["limits"]["general"]["maxRequests"], 10_000);
    }

    #[test]
    fn test_reset_key_and_all() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(&RateLimitingConfig::default(), clock).unwrap();
        let req = request();
        limiter.check(&req, "order_create").unwrap();
        limiter.check(&req, "order_read").unwrap();

        assert!(limiter.reset("order_create:198.51.100.3:7"));
        assert_eq!(limiter.stats().total_keys, 1);
        assert_eq!(limiter.reset_all(), 1);
        assert_eq!(limiter.stats().total_keys, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RateLimitingConfig {
            sweep_interval_secs: 0,
            ..RateLimitingConfig::default()
        };
        assert!(matches!(RateLimiter::with_config(&config), Err(GuardError::Config(_))));

        config.sweep_interval_secs = 300;
        config.adaptive.load_factor = 2.0;
        assert!(matches!(RateLimiter::with_config(&config), Err(GuardError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let limiter = RateLimiter::new();
        limiter.start();
        limiter.start();
        assert!(limiter.is_running());

        limiter.shutdown();
        assert!(!limiter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_load_reduces_limits() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = RateLimitingConfig::default();
        config.adaptive.key_threshold = 2;
        let limiter = RateLimiter::with_clock(&config, clock).unwrap();

        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            let req = RequestDescriptor {
                forwarded_ip: Some(ip.to_string()),
                ..Default::default()
            };
            limiter.check(&req, "general").unwrap();
        }

        assert!(limiter.observe_load());
        assert_eq!(limiter.policies().get("general").policy.max_requests, 5_000);
        limiter.shutdown();
    }
}
