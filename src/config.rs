//! Configuration management for Petalguard.
//!
//! Settings are read from an optional YAML file and then overridden by
//! `PETALGUARD__`-prefixed environment variables, e.g.
//! `PETALGUARD__RATE_LIMITING__FAIL_OPEN=false`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};

use crate::error::{GuardError, Result};
use crate::ratelimit::policy::{default_policies, Policy};
use crate::ratelimit::RetriggerPolicy;

/// Main configuration for the Petalguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy per operation class
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, Policy>,

    /// Lockout after a window is exceeded, in seconds
    #[serde(default = "default_penalty_secs")]
    pub penalty_secs: u64,

    /// Idle time after which a key is swept, in seconds
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Let requests through when the limiter itself fails
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            penalty_secs: default_penalty_secs(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            fail_open: default_fail_open(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn penalty_ms(&self) -> u64 {
        self.penalty_secs.saturating_mul(1000)
    }

    pub fn stale_after_ms(&self) -> u64 {
        self.stale_after_secs.saturating_mul(1000)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject settings the limiter cannot run with. Policies are checked by
    /// the policy table.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(GuardError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        for (name, secs) in [
            ("penalty_secs", self.penalty_secs),
            ("stale_after_secs", self.stale_after_secs),
        ] {
            if secs.checked_mul(1000).is_none() {
                return Err(GuardError::Config(format!("{} is too large: {}", name, secs)));
            }
        }
        self.adaptive.validate()
    }
}

fn default_penalty_secs() -> u64 {
    15 * 60
}

fn default_stale_after_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_fail_open() -> bool {
    true
}

/// Load shedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "default_adaptive_enabled")]
    pub enabled: bool,

    /// Tracked keys above which limits are reduced
    #[serde(default = "default_key_threshold")]
    pub key_threshold: usize,

    /// Multiplier applied to every `max_requests`
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,

    /// Time until reduced limits are restored, in seconds
    #[serde(default = "default_restore_delay_secs")]
    pub restore_delay_secs: u64,

    #[serde(default)]
    pub retrigger: RetriggerPolicy,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_adaptive_enabled(),
            key_threshold: default_key_threshold(),
            load_factor: default_load_factor(),
            restore_delay_secs: default_restore_delay_secs(),
            retrigger: RetriggerPolicy::default(),
        }
    }
}

impl AdaptiveConfig {
    pub fn restore_delay(&self) -> Duration {
        Duration::from_secs(self.restore_delay_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let factor = self.load_factor;
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(GuardError::Config(format!(
                "adaptive.load_factor must be in (0, 1], got {}",
                factor
            )));
        }
        Ok(())
    }
}

fn default_adaptive_enabled() -> bool {
    true
}

fn default_key_threshold() -> usize {
    1000
}

fn default_load_factor() -> f64 {
    0.5
}

fn default_restore_delay_secs() -> u64 {
    10 * 60
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GuardConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PETALGUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Parse configuration from a YAML string, ignoring the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GuardError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.rate_limiting.penalty_ms(), 900_000);
        assert_eq!(config.rate_limiting.stale_after_ms(), 1_800_000);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(300));
        assert!(config.rate_limiting.fail_open);
        assert_eq!(config.rate_limiting.adaptive.key_threshold, 1000);
        assert_eq!(config.rate_limiting.adaptive.restore_delay(), Duration::from_secs(600));
        assert_eq!(config.rate_limiting.policies.len(), 6);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
rate_limiting:
  fail_open: false
  penalty_secs: 60
  policies:
    general:
      max_requests: 100
      window_ms: 1000
    order_create:
      max_requests: 3
      window_ms: 1000
      skip_successful_requests: true
  adaptive:
    key_threshold: 50
    retrigger: extend
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert!(!config.rate_limiting.fail_open);
        assert_eq!(config.rate_limiting.penalty_ms(), 60_000);
        assert_eq!(config.rate_limiting.policies.len(), 2);
        assert!(config.rate_limiting.policies["order_create"].skip_successful_requests);
        assert_eq!(config.rate_limiting.adaptive.key_threshold, 50);
        assert_eq!(config.rate_limiting.adaptive.retrigger, RetriggerPolicy::Extend);
        assert_eq!(config.rate_limiting.adaptive.load_factor, 0.5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_yaml_output_loads_back() {
        let mut config = GuardConfig::default();
        config.rate_limiting.adaptive.retrigger = RetriggerPolicy::Extend;
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("retrigger: extend"));

        let parsed: GuardConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.rate_limiting.policies, config.rate_limiting.policies);
        assert_eq!(parsed.rate_limiting.adaptive.retrigger, RetriggerPolicy::Extend);

        let loaded = GuardConfig::from_yaml(&yaml).unwrap();
        assert_eq!(loaded.rate_limiting.policies, config.rate_limiting.policies);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(RateLimitingConfig::default().validate().is_ok());

        let zero_sweep = RateLimitingConfig {
            sweep_interval_secs: 0,
            ..RateLimitingConfig::default()
        };
        assert!(zero_sweep.validate().is_err());

        let huge_penalty = RateLimitingConfig {
            penalty_secs: u64::MAX,
            ..RateLimitingConfig::default()
        };
        assert!(huge_penalty.validate().is_err());
        assert_eq!(huge_penalty.penalty_ms(), u64::MAX);

        let huge_stale = RateLimitingConfig {
            stale_after_secs: u64::MAX / 10,
            ..RateLimitingConfig::default()
        };
        assert!(huge_stale.validate().is_err());

        for factor in [0.0, -0.5, 1.5, f64::NAN] {
            let mut config = RateLimitingConfig::default();
            config.adaptive.load_factor = factor;
            assert!(config.validate().is_err(), "factor {} accepted", factor);
        }
    }

    #[test]
    fn test_camel_case_policy_keys_load() {
        let yaml = r#"
rate_limiting:
  policies:
    general:
      maxRequests: 100
      windowMs: 1000
    order_create:
      maxRequests: 3
      windowMs: 1000
      skipSuccessfulRequests: true
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        let policies = &config.rate_limiting.policies;
        assert_eq!(policies["general"], Policy::new(100, 1000));
        assert_eq!(policies["order_create"].max_requests, 3);
        assert!(policies["order_create"].skip_successful_requests);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(GuardConfig::from_file("/nonexistent/petalguard.yaml").is_err());
    }
}
