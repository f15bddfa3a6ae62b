//! Per-class rate limit policies.
//!
//! The table keeps the configured (base) policies alongside the current
//! ones. Load shedding scales the current ceilings from the base values,
//! and `restore` copies the base back.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::class::{self, OperationClass};
use crate::error::{GuardError, Result};

/// Limits for one operation class.
///
/// Serialized in camelCase. Input accepts snake_case, camelCase, and the
/// lowercased camelCase the `config` loader produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Accepted requests per window
    #[serde(
        rename(serialize = "maxRequests"),
        alias = "maxRequests",
        alias = "maxrequests"
    )]
    pub max_requests: u64,
    /// Sliding window length in milliseconds
    #[serde(rename(serialize = "windowMs"), alias = "windowMs", alias = "windowms")]
    pub window_ms: u64,
    /// Give the slot back when the response is a success
    #[serde(
        default,
        rename(serialize = "skipSuccessfulRequests"),
        alias = "skipSuccessfulRequests",
        alias = "skipsuccessfulrequests"
    )]
    pub skip_successful_requests: bool,
}

impl Policy {
    pub const fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            skip_successful_requests: false,
        }
    }

    fn validate(&self, class: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GuardError::Config(format!(
                "policy '{}' must allow at least one request",
                class
            )));
        }
        if self.window_ms == 0 {
            return Err(GuardError::Config(format!(
                "policy '{}' must have a non-zero window",
                class
            )));
        }
        Ok(())
    }
}

const MINUTE_MS: u64 = 60 * 1000;

/// Limit used if the table somehow lacks a `general` entry.
const GENERAL_POLICY: Policy = Policy::new(10_000, MINUTE_MS);

/// The built-in policy table.
pub fn default_policies() -> BTreeMap<String, Policy> {
    [
        (class::GENERAL, GENERAL_POLICY),
        (class::ORDER_CREATE, Policy::new(1_000, MINUTE_MS)),
        (class::ORDER_READ, Policy::new(2_000, MINUTE_MS)),
        (class::CRITICAL_ENDPOINTS, Policy::new(1_000, 15 * MINUTE_MS)),
        (class::ADMIN_OPERATIONS, Policy::new(2_000, MINUTE_MS)),
        (class::FILE_UPLOAD, Policy::new(500, MINUTE_MS)),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}

/// Custom class names become key prefixes, so they must not clash with a
/// built-in prefix or contain the key separator.
fn validate_custom_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') {
        return Err(GuardError::Config(format!(
            "invalid operation class name '{}'",
            name
        )));
    }
    if OperationClass::ALL.iter().any(|c| c.key_prefix() == name) {
        return Err(GuardError::Config(format!(
            "operation class '{}' clashes with a built-in key prefix",
            name
        )));
    }
    Ok(())
}

/// A policy looked up for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    /// Class name as requested by the route
    pub class: String,
    pub policy: Policy,
    /// True when `class` had no entry and `general` was used
    pub fallback: bool,
}

struct TableState {
    base: BTreeMap<String, Policy>,
    current: BTreeMap<String, Policy>,
    load_factor: Option<f64>,
}

/// Mutable policy table shared by the limiter and the adaptive controller.
pub struct PolicyTable {
    state: RwLock<TableState>,
}

impl PolicyTable {
    /// Build a table, validating every policy.
    pub fn new(policies: BTreeMap<String, Policy>) -> Result<Self> {
        Self::validate(&policies)?;
        Ok(Self {
            state: RwLock::new(TableState {
                current: policies.clone(),
                base: policies,
                load_factor: None,
            }),
        })
    }

    /// Startup checks: `general` must exist and every policy must be usable.
    pub fn validate(policies: &BTreeMap<String, Policy>) -> Result<()> {
        if !policies.contains_key(class::GENERAL) {
            return Err(GuardError::Config(
                "rate limit policies must define 'general'".to_string(),
            ));
        }

        for (name, policy) in policies {
            policy.validate(name)?;
            if OperationClass::from_name(name).is_none() {
                validate_custom_name(name)?;
                info!(class = %name, "Registered custom operation class");
            }
        }

        for known in OperationClass::ALL {
            if !policies.contains_key(known.name()) {
                warn!(
                    class = %known,
                    "No policy for operation class, requests will use 'general'"
                );
            }
        }

        Ok(())
    }

    /// Look up the current policy for `class`, falling back to `general`.
    pub fn get(&self, class: &str) -> ResolvedPolicy {
        let state = self.state.read();

        if let Some(policy) = state.current.get(class) {
            return ResolvedPolicy {
                class: class.to_string(),
                policy: *policy,
                fallback: false,
            };
        }

        warn!(
            class = %class,
            "Unknown operation class, falling back to 'general' policy"
        );

        ResolvedPolicy {
            class: class.to_string(),
            policy: state
                .current
                .get(class::GENERAL)
                .copied()
                .unwrap_or(GENERAL_POLICY),
            fallback: true,
        }
    }

    /// Scale every ceiling to `floor(base * factor)`, never below 1.
    pub fn apply_load_factor(&self, factor: f64) -> Result<()> {
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(GuardError::Config(format!(
                "load factor must be in (0, 1], got {}",
                factor
            )));
        }

        let mut state = self.state.write();
        let scaled: BTreeMap<String, Policy> = state
            .base
            .iter()
            .map(|(name, base)| {
                let max_requests = ((base.max_requests as f64 * factor).floor() as u64).max(1);
                (name.clone(), Policy { max_requests, ..*base })
            })
            .collect();
        state.current = scaled;
        state.load_factor = Some(factor);
        Ok(())
    }

    /// Put the configured ceilings back.
    pub fn restore(&self) {
        let mut state = self.state.write();
        state.current = state.base.clone();
        state.load_factor = None;
    }

    /// Whether a load factor is currently applied.
    pub fn is_reduced(&self) -> bool {
        self.state.read().load_factor.is_some()
    }

    pub fn load_factor(&self) -> Option<f64> {
        self.state.read().load_factor
    }

    /// Current policies.
    pub fn snapshot(&self) -> BTreeMap<String, Policy> {
        self.state.read().current.clone()
    }

    /// Configured policies, ignoring any load factor.
    pub fn base(&self) -> BTreeMap<String, Policy> {
        self.state.read().base.clone()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let policies = default_policies();
        Self {
            state: RwLock::new(TableState {
                current: policies.clone(),
                base: policies,
                load_factor: None,
            }),
        }
    }
}
