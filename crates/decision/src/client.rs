//! DecisionClient: キャッシュ・タイムアウト・1 回の再試行・サーキットブレーカーを備えた判定クライアント。

use std::sync::Arc;
use std::time::Duration;

use k1s0_circuit_breaker::CircuitBreaker;
use k1s0_telemetry::{CacheOutcome, EventSink, GatewayEvent};

use crate::cache::DecisionCache;
use crate::engine::{PolicyEngine, PolicyEngineError};
use crate::query::DecisionQuery;
use crate::result::DecisionResult;
use crate::retry::RetryConfig;

/// 判定段階のエラー。キャッシュの stale 応答も無い場合にのみ返る。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("policy engine unavailable: {0}")]
    PolicyEngineUnavailable(String),

    #[error("policy engine timed out")]
    PolicyEngineTimeout,
}

impl DecisionError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionError::PolicyEngineUnavailable(_) => "policy_engine_unavailable",
            DecisionError::PolicyEngineTimeout => "policy_engine_timeout",
        }
    }
}

impl From<PolicyEngineError> for DecisionError {
    fn from(e: PolicyEngineError) -> Self {
        match e {
            PolicyEngineError::Timeout => DecisionError::PolicyEngineTimeout,
            other => DecisionError::PolicyEngineUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionClientConfig {
    /// 1 回の問い合わせのタイムアウト
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DecisionClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

pub struct DecisionClient {
    engine: Arc<dyn PolicyEngine>,
    cache: Arc<DecisionCache>,
    breaker: CircuitBreaker,
    config: DecisionClientConfig,
    events: Arc<dyn EventSink>,
}

impl DecisionClient {
    pub fn new(
        engine: Arc<dyn PolicyEngine>,
        cache: Arc<DecisionCache>,
        breaker: CircuitBreaker,
        config: DecisionClientConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            engine,
            cache,
            breaker,
            config,
            events,
        }
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// 判定を返す。鮮度期限内のキャッシュがあればネットワークにアクセスしない。
    ///
    /// エンジンが利用できない場合は有効期限内のキャッシュを stale として返し、
    /// それも無ければ `DecisionError` を返す。
    pub async fn decide(&self, query: &DecisionQuery) -> Result<DecisionResult, DecisionError> {
        if let Some(result) = self.cache.get_fresh(query).await {
            self.emit_cache(CacheOutcome::Hit);
            return Ok(result);
        }
        self.emit_cache(CacheOutcome::Miss);

        let generation = self.cache.generation();
        match self.query_engine(query).await {
            Ok(result) => {
                self.cache
                    .put_if_generation(query, result.clone(), generation)
                    .await;
                Ok(result)
            }
            Err(e) => {
                if let Some(stale) = self.cache.get_stale(query).await {
                    tracing::warn!(
                        error = %e,
                        subject = %query.subject,
                        "serving stale decision while policy engine is unavailable"
                    );
                    self.emit_cache(CacheOutcome::StaleServe);
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    /// エンジンに問い合わせる。通信系の失敗に限り、ジッター付きの待機後に 1 回だけ再試行する。
    async fn query_engine(&self, query: &DecisionQuery) -> Result<DecisionResult, DecisionError> {
        let mut last_error: Option<DecisionError> = None;

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.compute_delay()).await;
            }

            // 待機中に Open になった場合は再試行しない
            let Some(permit) = self.breaker.try_acquire() else {
                return Err(last_error.unwrap_or_else(|| {
                    DecisionError::PolicyEngineUnavailable("circuit breaker open".into())
                }));
            };

            let outcome =
                match tokio::time::timeout(self.config.timeout, self.engine.evaluate(query)).await {
                    Ok(result) => result,
                    Err(_) => Err(PolicyEngineError::Timeout),
                };

            match outcome {
                Ok(decision) => {
                    permit.success();
                    let reason = decision.reason.unwrap_or_else(|| {
                        if decision.allowed {
                            "policy_allow".to_string()
                        } else {
                            "policy_deny".to_string()
                        }
                    });
                    return Ok(DecisionResult::live(decision.allowed, reason));
                }
                Err(e) => {
                    permit.failure();
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "policy engine query failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e.into());
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DecisionError::PolicyEngineUnavailable("no attempt made".into())
        }))
    }

    /// ポリシーバージョンを更新する。変更時はキャッシュ済みの判定をすべて破棄する。
    pub async fn set_policy_version(&self, version: &str) -> bool {
        self.cache.set_policy_version(version).await
    }

    fn emit_cache(&self, outcome: CacheOutcome) {
        self.events.emit(&GatewayEvent::DecisionCache { outcome });
    }
}
