//! Sliding-window request store with penalty blocks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::clock::Clock;

/// Penalty applied once a key exceeds its window (15 minutes).
pub const DEFAULT_PENALTY_MS: u64 = 15 * 60 * 1000;
/// Entries idle for longer than this are swept (30 minutes).
pub const DEFAULT_STALE_AFTER_MS: u64 = 30 * 60 * 1000;
/// How often the sweeper runs (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Window state for one derived key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateWindowEntry {
    /// Accepted request timestamps still inside the trailing window
    pub requests: VecDeque<u64>,
    /// Whether the key is serving a penalty
    pub blocked: bool,
    /// End of the penalty; only meaningful while `blocked`
    pub blocked_until: Option<u64>,
}

impl RateWindowEntry {
    /// Timestamp of the most recent accepted request, or 0.
    pub fn last_request(&self) -> u64 {
        self.requests.back().copied().unwrap_or(0)
    }

    fn prune(&mut self, window_start: u64) {
        while self.requests.front().is_some_and(|&t| t <= window_start) {
            self.requests.pop_front();
        }
    }

    fn penalty_active(&self, now: u64) -> bool {
        self.blocked && self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Outcome of evaluating one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining_requests: u64,
    /// Milliseconds since epoch when the caller's allowance resets
    pub reset_time: u64,
}

/// Store-wide counters for health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    #[serde(rename = "totalKeys")]
    pub total_keys: usize,
    #[serde(rename = "blockedKeys")]
    pub blocked_keys: usize,
}

/// In-memory map from derived key to its window state.
///
/// Each evaluation holds the key's shard lock for its whole
/// prune / block-check / append sequence, so concurrent requests for
/// the same key are serialized.
pub struct RateLimitStore {
    entries: DashMap<String, RateWindowEntry>,
    penalty_ms: u64,
}

impl RateLimitStore {
    /// Create a store with the default 15 minute penalty.
    pub fn new() -> Self {
        Self::with_penalty(DEFAULT_PENALTY_MS)
    }

    pub fn with_penalty(penalty_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            penalty_ms,
        }
    }

    /// Evaluate and, when allowed, record a request for `key` at `now`.
    pub fn evaluate(&self, key: &str, max_requests: u64, window_ms: u64, now: u64) -> WindowDecision {
        let mut entry = self.entries.entry(key.to_string()).or_default();

        // Before the first full window nothing has aged out yet.
        if let Some(window_start) = now.checked_sub(window_ms) {
            entry.prune(window_start);
        }

        if entry.penalty_active(now) {
            let until = entry.blocked_until.unwrap_or(now);
            trace!(key = %key, blocked_until = until, "Key is serving a penalty");
            return WindowDecision {
                allowed: false,
                remaining_requests: 0,
                reset_time: until,
            };
        }

        if entry.blocked {
            debug!(key = %key, "Penalty expired");
            entry.blocked = false;
            entry.blocked_until = None;
        }

        if entry.requests.len() as u64 >= max_requests {
            let until = now.saturating_add(self.penalty_ms);
            entry.blocked = true;
            entry.blocked_until = Some(until);
            debug!(
                key = %key,
                limit = max_requests,
                blocked_until = until,
                "Window exceeded, applying penalty"
            );
            return WindowDecision {
                allowed: false,
                remaining_requests: 0,
                reset_time: until,
            };
        }

        entry.requests.push_back(now);

        WindowDecision {
            allowed: true,
            remaining_requests: max_requests - entry.requests.len() as u64,
            reset_time: now.saturating_add(window_ms),
        }
    }

    /// Give back one accepted slot recorded at `timestamp`.
    ///
    /// Returns `false` if the key or timestamp is no longer tracked.
    pub fn release(&self, key: &str, timestamp: u64) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        match entry.requests.iter().rposition(|&t| t == timestamp) {
            Some(idx) => {
                entry.requests.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Drop entries whose last request is older than `stale_after_ms`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: u64, stale_after_ms: u64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = now.saturating_sub(entry.last_request()) <= stale_after_ms;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let mut blocked_keys = 0;
        for entry in self.entries.iter() {
            if entry.blocked {
                blocked_keys += 1;
            }
        }
        StoreStats {
            total_keys: self.entries.len(),
            blocked_keys,
        }
    }

    /// Remove one key. Returns whether it existed.
    pub fn reset(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn reset_all(&self) {
        self.entries.clear();
    }

    /// Snapshot of the entry for `key`, if tracked.
    pub fn entry(&self, key: &str) -> Option<RateWindowEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Number of recorded requests for `key` (not pruned).
    pub fn request_count(&self, key: &str) -> Option<usize> {
        self.entries.get(key).map(|e| e.requests.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the periodic sweep task.
///
/// The task is aborted by `stop()` or when the handle is dropped.
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a task that sweeps `store` every `interval`.
    ///
    /// Must be called from within a Tokio runtime. The first sweep runs one
    /// full interval after spawning. A zero interval uses the default.
    pub fn spawn(
        store: Arc<RateLimitStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        stale_after_ms: u64,
    ) -> Self {
        let interval = if interval.is_zero() {
            warn!("Sweep interval is zero, using the default");
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let now = match clock.now_ms() {
                    Ok(now) => now,
                    Err(e) => {
                        warn!(error = %e, "Skipping rate limit sweep");
                        continue;
                    }
                };

                let removed = store.sweep(now, stale_after_ms);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = store.len(),
                        "Swept stale rate limit entries"
                    );
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
