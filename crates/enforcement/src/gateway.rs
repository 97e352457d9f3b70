//! EnforcementCore: 資格情報の検証からポリシー判定までを 1 回の authorize にまとめる。
//!
//! 要求ごとの状態遷移:
//! `Start → Verifying → {VerifyFailed | Verified → Deciding → {Decided | DecisionUnavailable → DefaultApplied}}`
//! どの経路も必ず [`Verdict`] で終わり、エラーを呼び出し元へ返すことはない。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use k1s0_auth::{ClaimSet, CredentialVerifier};
use k1s0_decision::{DecisionClient, DecisionQuery};
use k1s0_telemetry::{EventSink, GatewayEvent};
use tokio::task::JoinHandle;
use tracing::{instrument, Span};

use crate::verdict::{DefaultVerdict, Verdict};

/// 検証で期待する発行者・オーディエンスと、判定不能時の既定値。
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    pub issuer: String,
    pub audience: String,
    pub default_verdict: DefaultVerdict,
}

pub struct EnforcementCore {
    verifier: CredentialVerifier,
    decisions: Arc<DecisionClient>,
    settings: EnforcementSettings,
    events: Arc<dyn EventSink>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EnforcementCore {
    pub fn new(
        verifier: CredentialVerifier,
        decisions: Arc<DecisionClient>,
        settings: EnforcementSettings,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            verifier,
            decisions,
            settings,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    pub fn decisions(&self) -> &Arc<DecisionClient> {
        &self.decisions
    }

    pub fn default_verdict(&self) -> DefaultVerdict {
        self.settings.default_verdict
    }

    /// 資格情報を検証し、対象の操作を認可するかを判定する。
    #[instrument(
        name = "authorize",
        skip(self, credential, context),
        fields(subject = tracing::field::Empty)
    )]
    pub async fn authorize(
        &self,
        credential: &str,
        action: &str,
        resource: &str,
        context: &BTreeMap<String, String>,
    ) -> Verdict {
        let verdict = self.evaluate(credential, action, resource, context).await;
        self.issue(&verdict);
        verdict
    }

    async fn evaluate(
        &self,
        credential: &str,
        action: &str,
        resource: &str,
        context: &BTreeMap<String, String>,
    ) -> Verdict {
        let claims = match self
            .verifier
            .verify(credential, &self.settings.issuer, &self.settings.audience)
            .await
        {
            Ok(claims) => claims,
            Err(e) => return Verdict::verify_failed(e.kind()),
        };
        Span::current().record("subject", claims.sub.as_str());

        let query = build_query(&claims, action, resource, context);
        match self.decisions.decide(&query).await {
            Ok(result) => Verdict::decided(
                claims.sub,
                result.allowed,
                result.reason.clone(),
                result.is_stale(),
            ),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    default_verdict = self.settings.default_verdict.as_str(),
                    "decision unavailable, applying default verdict"
                );
                Verdict::default_applied(claims.sub, self.settings.default_verdict, e.kind())
            }
        }
    }

    fn issue(&self, verdict: &Verdict) {
        tracing::info!(
            allow = verdict.allow,
            reason = %verdict.reason,
            outcome = verdict.outcome.as_str(),
            stale = verdict.stale,
            default_applied = verdict.default_applied,
            "verdict issued"
        );
        self.events.emit(&GatewayEvent::VerdictIssued {
            allow: verdict.allow,
            reason: verdict.reason.clone(),
            outcome: verdict.outcome.as_str(),
            stale: verdict.stale,
            default_applied: verdict.default_applied,
            subject: verdict.subject.clone(),
        });
    }

    /// バックグラウンドタスクを停止し、終了を待つ。
    pub async fn shutdown(&self) {
        self.verifier.resolver().shutdown();
        self.decisions.cache().shutdown();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task terminated abnormally");
            }
        }
    }
}

/// ClaimSet と要求内容から問い合わせを組み立てる。
///
/// `username` と `roles` はクレーム由来の値が常に優先され、呼び出し側の同名キーは使われない。
pub fn build_query(
    claims: &ClaimSet,
    action: &str,
    resource: &str,
    context: &BTreeMap<String, String>,
) -> DecisionQuery {
    let mut context = context.clone();
    match &claims.preferred_username {
        Some(username) => {
            context.insert("username".to_string(), username.clone());
        }
        None => {
            context.remove("username");
        }
    }
    context.insert("roles".to_string(), claims.realm_roles().join(","));

    DecisionQuery::new(claims.sub.clone(), action, resource).with_context_map(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Outcome;
    use k1s0_circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use k1s0_decision::{
        DecisionCache, DecisionCacheConfig, DecisionClientConfig, EngineDecision,
        MockPolicyEngine, PolicyEngineError, RetryConfig,
    };
    use k1s0_keyset::{JwkDocument, KeyResolver, KeyResolverConfig, MockKeySetFetcher};
    use k1s0_test_helper::{
        jwks_document, RecordingEventSink, TestClaims, TestKeyPair, TEST_AUDIENCE, TEST_ISSUER,
    };
    use std::time::Duration;

    async fn core_with(
        engine: MockPolicyEngine,
        default_verdict: DefaultVerdict,
        events: Arc<RecordingEventSink>,
    ) -> EnforcementCore {
        let k1 = TestKeyPair::rsa("k1");
        let document: JwkDocument = serde_json::from_value(jwks_document(&[&k1])).unwrap();
        let mut fetcher = MockKeySetFetcher::new();
        fetcher
            .expect_fetch()
            .returning(move || Ok(document.clone()));

        let resolver = KeyResolver::new(
            Arc::new(fetcher),
            KeyResolverConfig::default(),
            events.clone(),
        );
        resolver.refresh().await.unwrap();
        let verifier = CredentialVerifier::new(resolver, Duration::from_secs(30), events.clone());

        let cache = DecisionCache::new(&DecisionCacheConfig::default(), "1").unwrap();
        let decisions = DecisionClient::new(
            Arc::new(engine),
            Arc::new(cache),
            CircuitBreaker::new("policy-engine", CircuitBreakerConfig::default()),
            DecisionClientConfig {
                timeout: Duration::from_millis(100),
                retry: RetryConfig {
                    backoff: Duration::from_millis(1),
                    jitter: false,
                },
            },
            events.clone(),
        );

        EnforcementCore::new(
            verifier,
            Arc::new(decisions),
            EnforcementSettings {
                issuer: TEST_ISSUER.to_string(),
                audience: TEST_AUDIENCE.to_string(),
                default_verdict,
            },
            events,
        )
    }

    fn engine_down() -> MockPolicyEngine {
        let mut engine = MockPolicyEngine::new();
        engine
            .expect_evaluate()
            .returning(|_| Err(PolicyEngineError::Transport("connection refused".into())));
        engine
    }

    fn token() -> String {
        TestKeyPair::rsa("k1").sign(&TestClaims::for_user("bob-uuid", "bob"))
    }

    #[tokio::test]
    async fn test_fail_closed_default() {
        let events = Arc::new(RecordingEventSink::new());
        let core = core_with(engine_down(), DefaultVerdict::Deny, events.clone()).await;

        let verdict = core
            .authorize(&token(), "GET", "/data", &BTreeMap::new())
            .await;
        assert!(!verdict.allow);
        assert!(verdict.default_applied);
        assert_eq!(verdict.outcome, Outcome::DefaultApplied);
        assert_eq!(verdict.reason, "default_deny:policy_engine_unavailable");
        assert_eq!(verdict.subject.as_deref(), Some("bob-uuid"));
        assert_eq!(
            events.count(|e| matches!(
                e,
                GatewayEvent::VerdictIssued {
                    default_applied: true,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_fail_open_default() {
        let events = Arc::new(RecordingEventSink::new());
        let core = core_with(engine_down(), DefaultVerdict::Allow, events).await;

        let verdict = core
            .authorize(&token(), "GET", "/data", &BTreeMap::new())
            .await;
        assert!(verdict.allow);
        assert!(verdict.default_applied);
        assert_eq!(verdict.reason, "default_allow:policy_engine_unavailable");
    }

    #[tokio::test]
    async fn test_verification_failure_denies_without_decision() {
        let mut engine = MockPolicyEngine::new();
        engine.expect_evaluate().never();
        let events = Arc::new(RecordingEventSink::new());
        // fail-open でも検証失敗は常に拒否
        let core = core_with(engine, DefaultVerdict::Allow, events.clone()).await;

        let expired = TestKeyPair::rsa("k1").sign(&TestClaims {
            exp: 1_000,
            ..TestClaims::default()
        });
        let verdict = core.authorize(&expired, "GET", "/data", &BTreeMap::new()).await;
        assert!(!verdict.allow);
        assert_eq!(verdict.outcome, Outcome::VerifyFailed);
        assert_eq!(verdict.reason, "expired");
        assert!(!verdict.default_applied);
        assert_eq!(verdict.subject, None);
        assert_eq!(
            events.count(|e| matches!(e, GatewayEvent::VerificationFailed { kind: "expired" })),
            1
        );
    }

    #[tokio::test]
    async fn test_decided_verdict_uses_claims_context() {
        let mut engine = MockPolicyEngine::new();
        engine
            .expect_evaluate()
            .withf(|q| {
                q.subject == "bob-uuid"
                    && q.context.get("username").map(String::as_str) == Some("bob")
                    && q.context.get("roles").map(String::as_str) == Some("user")
                    && q.context.get("tenant").map(String::as_str) == Some("acme")
            })
            .times(1)
            .returning(|_| {
                Ok(EngineDecision {
                    allowed: true,
                    reason: None,
                })
            });
        let core = core_with(engine, DefaultVerdict::Deny, Arc::new(RecordingEventSink::new())).await;

        let context = BTreeMap::from([
            ("tenant".to_string(), "acme".to_string()),
            ("username".to_string(), "mallory".to_string()),
        ]);
        let verdict = core.authorize(&token(), "GET", "/data", &context).await;
        assert!(verdict.allow);
        assert_eq!(verdict.outcome, Outcome::Decided);
        assert_eq!(verdict.reason, "policy_allow");
        assert!(!verdict.stale);
    }

    #[test]
    fn test_build_query_strips_spoofed_username() {
        let claims: ClaimSet =
            serde_json::from_value(serde_json::json!({"sub": "svc-1", "exp": 1})).unwrap();
        let context = BTreeMap::from([
            ("username".to_string(), "admin".to_string()),
            ("roles".to_string(), "admin".to_string()),
        ]);
        let query = build_query(&claims, "POST", "/jobs", &context);
        assert!(!query.context.contains_key("username"));
        assert_eq!(query.context.get("roles").map(String::as_str), Some(""));
    }
}
