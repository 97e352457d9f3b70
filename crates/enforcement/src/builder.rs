//! 設定からのコンポーネント組み立てと、バックグラウンドタスクのライフサイクル。

use std::sync::{Arc, PoisonError};

use k1s0_auth::CredentialVerifier;
use k1s0_circuit_breaker::CircuitBreaker;
use k1s0_decision::{CacheError, DecisionCache, DecisionClient, OpaPolicyEngine, PolicyEngineError};
use k1s0_keyset::{JwksHttpFetcher, KeyResolver, KeySetError};
use k1s0_telemetry::{init_logger, parse_log_level, EventSink, LoggerError};

use crate::config::{validate, ConfigError, GatewayConfig, LogConfig};
use crate::gateway::{EnforcementCore, EnforcementSettings};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build key fetcher: {0}")]
    KeySet(#[from] KeySetError),
    #[error("failed to build policy engine client: {0}")]
    PolicyEngine(#[from] PolicyEngineError),
    #[error("failed to build decision cache: {0}")]
    Cache(#[from] CacheError),
}

/// 設定に従って tracing のロガーを初期化する。
pub fn init_tracing(log: &LogConfig) -> Result<(), LoggerError> {
    let level =
        parse_log_level(&log.level).ok_or_else(|| LoggerError::UnknownLevel(log.level.clone()))?;
    init_logger(level, &log.format)
}

impl EnforcementCore {
    /// 設定から HTTP の鍵取得クライアントと OPA クライアントを組み立てる。
    pub fn from_config(
        config: &GatewayConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, BuildError> {
        validate(config)?;

        let fetcher = JwksHttpFetcher::new(&config.keys.jwks_url, config.keys.fetch_timeout())?;
        let resolver = KeyResolver::new(
            Arc::new(fetcher),
            config.keys.resolver_config(),
            Arc::clone(&events),
        );
        let verifier =
            CredentialVerifier::new(resolver, config.auth.clock_skew(), Arc::clone(&events));

        let engine = OpaPolicyEngine::new(
            &config.policy.url,
            &config.policy.package_path,
            config.policy.timeout(),
        )?;
        let cache = DecisionCache::new(
            &config.cache.cache_config(),
            config.policy.policy_version.clone(),
        )?;
        let breaker = CircuitBreaker::with_events(
            "policy-engine",
            config.policy.circuit_breaker.breaker_config(),
            Arc::clone(&events),
        );
        let decisions = DecisionClient::new(
            Arc::new(engine),
            Arc::new(cache),
            breaker,
            config.policy.client_config(),
            Arc::clone(&events),
        );

        Ok(Self::new(
            verifier,
            Arc::new(decisions),
            EnforcementSettings {
                issuer: config.auth.issuer.clone(),
                audience: config.auth.audience.clone(),
                default_verdict: config.policy.default_verdict,
            },
            events,
        ))
    }

    /// 初回の鍵取得を行い、鍵の定期更新とキャッシュ掃除のタスクを起動する。
    ///
    /// 初回取得の失敗は致命的ではない。更新が成功するまで要求は `no_keys_available` で拒否される。
    pub async fn start(&self) {
        let resolver = self.verifier().resolver();
        match resolver.refresh().await {
            Ok(set) => tracing::info!(
                version = set.version,
                key_count = set.len(),
                "initial signing key set loaded"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "initial key fetch failed, requests will be denied until a refresh succeeds"
            ),
        }

        let refresh = resolver.spawn_refresh_task();
        let sweeper = self.decisions().cache().spawn_sweeper();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([refresh, sweeper]);
    }
}
