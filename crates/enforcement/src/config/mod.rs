mod merge;
mod types;

use k1s0_decision::MAX_TTL;
use k1s0_keyset::MAX_ROTATION_GRACE;
use k1s0_telemetry::parse_log_level;
use thiserror::Error;

pub use merge::merge_yaml;
pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// YAML を読み込み GatewayConfig を返す。env_path があれば base にマージしてから解釈する。
pub fn load(base_path: &str, env_path: Option<&str>) -> Result<GatewayConfig, ConfigError> {
    let base = std::fs::read_to_string(base_path)?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&base)?;

    if let Some(env) = env_path {
        let env_data = std::fs::read_to_string(env)?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(&env_data)?;
        merge_yaml(&mut value, &overlay);
    }

    Ok(serde_yaml::from_value(value)?)
}

/// 読み込みとバリデーションをまとめて行う。
pub fn load_validated(
    base_path: &str,
    env_path: Option<&str>,
) -> Result<GatewayConfig, ConfigError> {
    let config = load(base_path, env_path)?;
    validate(&config)?;
    Ok(config)
}

fn require(value: &str, name: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{name} is required")));
    }
    Ok(())
}

fn require_url(value: &str, name: &str) -> Result<(), ConfigError> {
    require(value, name)?;
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{name} is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "{name} must use http or https"
        )));
    }
    Ok(())
}

fn positive(value: u64, name: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{name} must be > 0")));
    }
    Ok(())
}

fn at_most(value: u64, max: u64, name: &str) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::Validation(format!("{name} must be <= {max}")));
    }
    Ok(())
}

/// 時間設定の上限（1 年）
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;
const MAX_DURATION_MS: u64 = MAX_DURATION_SECS * 1000;
/// 資格情報の時刻検証で許容するずれの上限
const MAX_CLOCK_SKEW_SECS: u64 = 3600;

/// 設定値のバリデーション。
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    require(&config.auth.issuer, "auth.issuer")?;
    require(&config.auth.audience, "auth.audience")?;
    at_most(
        config.auth.clock_skew_secs,
        MAX_CLOCK_SKEW_SECS,
        "auth.clock_skew_secs",
    )?;

    let keys = &config.keys;
    require_url(&keys.jwks_url, "keys.jwks_url")?;
    positive(keys.refresh_interval_secs, "keys.refresh_interval_secs")?;
    positive(keys.fetch_timeout_ms, "keys.fetch_timeout_ms")?;
    positive(
        keys.forced_refresh_min_interval_secs,
        "keys.forced_refresh_min_interval_secs",
    )?;
    positive(keys.max_staleness_secs, "keys.max_staleness_secs")?;
    at_most(keys.refresh_interval_secs, MAX_DURATION_SECS, "keys.refresh_interval_secs")?;
    at_most(keys.fetch_timeout_ms, MAX_DURATION_MS, "keys.fetch_timeout_ms")?;
    at_most(
        keys.forced_refresh_min_interval_secs,
        MAX_DURATION_SECS,
        "keys.forced_refresh_min_interval_secs",
    )?;
    at_most(keys.max_staleness_secs, MAX_DURATION_SECS, "keys.max_staleness_secs")?;
    at_most(
        keys.rotation_grace_secs,
        MAX_ROTATION_GRACE.as_secs(),
        "keys.rotation_grace_secs",
    )?;
    if keys.max_staleness_secs < keys.refresh_interval_secs {
        return Err(ConfigError::Validation(
            "keys.max_staleness_secs must be >= keys.refresh_interval_secs".into(),
        ));
    }

    let policy = &config.policy;
    require_url(&policy.url, "policy.url")?;
    require(&policy.package_path, "policy.package_path")?;
    require(&policy.policy_version, "policy.policy_version")?;
    positive(policy.timeout_ms, "policy.timeout_ms")?;
    at_most(policy.timeout_ms, MAX_DURATION_MS, "policy.timeout_ms")?;
    at_most(policy.retry_backoff_ms, MAX_DURATION_MS, "policy.retry_backoff_ms")?;
    positive(
        u64::from(policy.circuit_breaker.failure_threshold),
        "policy.circuit_breaker.failure_threshold",
    )?;
    positive(
        u64::from(policy.circuit_breaker.success_threshold),
        "policy.circuit_breaker.success_threshold",
    )?;
    positive(
        policy.circuit_breaker.open_timeout_ms,
        "policy.circuit_breaker.open_timeout_ms",
    )?;
    at_most(
        policy.circuit_breaker.open_timeout_ms,
        MAX_DURATION_MS,
        "policy.circuit_breaker.open_timeout_ms",
    )?;

    let cache = &config.cache;
    positive(cache.max_capacity, "cache.max_capacity")?;
    positive(cache.soft_ttl_secs, "cache.soft_ttl_secs")?;
    positive(cache.sweep_interval_secs, "cache.sweep_interval_secs")?;
    at_most(cache.hard_ttl_secs, MAX_TTL.as_secs(), "cache.hard_ttl_secs")?;
    at_most(cache.sweep_interval_secs, MAX_DURATION_SECS, "cache.sweep_interval_secs")?;
    if cache.hard_ttl_secs <= cache.soft_ttl_secs {
        return Err(ConfigError::Validation(
            "cache.hard_ttl_secs must be greater than cache.soft_ttl_secs".into(),
        ));
    }

    if parse_log_level(&config.observability.log.level).is_none() {
        return Err(ConfigError::Validation(
            "observability.log.level must be trace, debug, info, warn, or error".into(),
        ));
    }
    Ok(())
}
