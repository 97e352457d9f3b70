use std::time::Duration;

use k1s0_circuit_breaker::CircuitBreakerConfig;
use k1s0_decision::{DecisionCacheConfig, DecisionClientConfig, RetryConfig};
use k1s0_keyset::KeyResolverConfig;
use serde::Deserialize;

use crate::verdict::DefaultVerdict;

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub auth: AuthConfig,
    pub keys: KeysConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

impl AuthConfig {
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeysConfig {
    pub jwks_url: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_forced_refresh_min_interval_secs")]
    pub forced_refresh_min_interval_secs: u64,
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_rotation_grace_secs")]
    pub rotation_grace_secs: u64,
}

impl KeysConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn resolver_config(&self) -> KeyResolverConfig {
        KeyResolverConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            fetch_timeout: self.fetch_timeout(),
            forced_refresh_min_interval: Duration::from_secs(self.forced_refresh_min_interval_secs),
            max_staleness: Duration::from_secs(self.max_staleness_secs),
            rotation_grace: Duration::from_secs(self.rotation_grace_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    pub url: String,
    #[serde(default = "default_package_path")]
    pub package_path: String,
    #[serde(default = "default_policy_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_policy_version")]
    pub policy_version: String,
    /// 既定値なし。設定ファイルで必ず allow / deny を指定する
    pub default_verdict: DefaultVerdict,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
}

impl PolicyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn client_config(&self) -> DecisionClientConfig {
        DecisionClientConfig {
            timeout: self.timeout(),
            retry: RetryConfig {
                backoff: Duration::from_millis(self.retry_backoff_ms),
                jitter: true,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl CircuitBreakerSection {
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_soft_ttl_secs")]
    pub soft_ttl_secs: u64,
    #[serde(default = "default_hard_ttl_secs")]
    pub hard_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_max_capacity(),
            soft_ttl_secs: default_soft_ttl_secs(),
            hard_ttl_secs: default_hard_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn cache_config(&self) -> DecisionCacheConfig {
        DecisionCacheConfig {
            max_capacity: self.max_capacity,
            soft_ttl: Duration::from_secs(self.soft_ttl_secs),
            hard_ttl: Duration::from_secs(self.hard_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_clock_skew_secs() -> u64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_fetch_timeout_ms() -> u64 {
    3000
}

fn default_forced_refresh_min_interval_secs() -> u64 {
    10
}

fn default_max_staleness_secs() -> u64 {
    3600
}

fn default_rotation_grace_secs() -> u64 {
    300
}

fn default_package_path() -> String {
    "authz.allow".to_string()
}

fn default_policy_timeout_ms() -> u64 {
    500
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_policy_version() -> String {
    "1".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_soft_ttl_secs() -> u64 {
    5
}

fn default_hard_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}
