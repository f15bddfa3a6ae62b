//! Load shedding based on the number of tracked keys.
//!
//! Crossing the key threshold scales every policy down by the configured
//! load factor and schedules a one-shot restore. What happens when the
//! threshold is crossed again while limits are already reduced is decided
//! by [`RetriggerPolicy`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::policy::PolicyTable;
use crate::config::AdaptiveConfig;

/// Behavior when load is detected while limits are already reduced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetriggerPolicy {
    /// Keep the pending restore; the new trigger is a no-op.
    #[default]
    Ignore,
    /// Cancel the pending restore and schedule a new one. Limits are not
    /// scaled again.
    Extend,
}

#[derive(Default)]
struct RestoreState {
    /// Bumped on every schedule and cancel; a restore task only acts if its
    /// generation is still current.
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Tightens the shared policy table under load and restores it later.
pub struct AdaptiveController {
    policies: Arc<PolicyTable>,
    config: AdaptiveConfig,
    restore: Arc<Mutex<RestoreState>>,
}

impl AdaptiveController {
    pub fn new(policies: Arc<PolicyTable>, config: AdaptiveConfig) -> Self {
        Self {
            policies,
            config,
            restore: Arc::new(Mutex::new(RestoreState::default())),
        }
    }

    /// Feed the current key count. Returns `true` if load shedding was
    /// started or extended by this call.
    pub fn observe(&self, total_keys: usize) -> bool {
        if !self.config.enabled || total_keys <= self.config.key_threshold {
            return false;
        }
        self.trigger(total_keys)
    }

    fn trigger(&self, total_keys: usize) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Cannot schedule rate limit restore outside a Tokio runtime");
                return false;
            }
        };

        let mut restore = self.restore.lock();

        if self.policies.is_reduced() {
            match self.config.retrigger {
                RetriggerPolicy::Ignore => {
                    debug!(active_keys = total_keys, "Limits already reduced, ignoring trigger");
                    return false;
                }
                RetriggerPolicy::Extend => {
                    if let Some(handle) = restore.handle.take() {
                        handle.abort();
                    }
                    info!(
                        active_keys = total_keys,
                        "High load persists, postponing rate limit restore"
                    );
                }
            }
        } else {
            if let Err(e) = self.policies.apply_load_factor(self.config.load_factor) {
                error!(error = %e, "Failed to apply load factor");
                return false;
            }
            warn!(
                active_keys = total_keys,
                load_factor = self.config.load_factor,
                "High load detected, applying stricter rate limits"
            );
        }

        restore.generation += 1;
        let generation = restore.generation;
        let state = self.restore.clone();
        let policies = self.policies.clone();
        let delay = self.config.restore_delay();

        restore.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let mut restore = state.lock();
            if restore.generation != generation {
                return;
            }
            policies.restore();
            restore.handle = None;
            info!("Rate limits restored to normal levels");
        }));

        true
    }

    /// Whether limits are currently reduced.
    pub fn is_reduced(&self) -> bool {
        self.policies.is_reduced()
    }

    /// Whether a restore is scheduled.
    pub fn restore_pending(&self) -> bool {
        self.restore
            .lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel any pending restore. The table is left as it is.
    pub fn shutdown(&self) {
        let mut restore = self.restore.lock();
        restore.generation += 1;
        if let Some(handle) = restore.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for AdaptiveController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
