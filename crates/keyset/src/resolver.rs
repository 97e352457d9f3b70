//! KeyResolver: 署名鍵セットの取得・キャッシュ・更新ライフサイクル。
//!
//! - 定期更新はバックグラウンドタスクで行い、取得失敗時は最後に成功したセットを使い続ける
//! - 未知の kid による強制更新は単一実行かつ最小間隔で抑止する
//! - 最後の成功から `max_staleness` を超えたセットは使用せず `KeysExpired` を返す
//! - 差し替え直前のセットは `rotation_grace` の間だけ参照可能

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use k1s0_telemetry::{EventSink, GatewayEvent, KeyRefreshOutcome};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::KeySetError;
use crate::fetcher::KeySetFetcher;
use crate::key::{parse_document, SigningKey, SigningKeySet};

/// 直前のセットを保持する猶予の上限。これを超える `rotation_grace` は上限に切り詰める。
pub const MAX_ROTATION_GRACE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// KeyResolver の動作設定。
#[derive(Debug, Clone)]
pub struct KeyResolverConfig {
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub forced_refresh_min_interval: Duration,
    pub max_staleness: Duration,
    pub rotation_grace: Duration,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(3),
            forced_refresh_min_interval: Duration::from_secs(10),
            max_staleness: Duration::from_secs(3600),
            rotation_grace: Duration::from_secs(300),
        }
    }
}

/// 強制更新の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedRefresh {
    /// 新しい鍵セットが利用可能になった（他リクエストによる同時更新を含む）。
    Refreshed,
    /// 最小間隔内のため取得を行わなかった。
    Throttled,
    Failed,
}

#[derive(Default)]
struct KeyState {
    current: Option<Arc<SigningKeySet>>,
    previous: Option<(Arc<SigningKeySet>, Instant)>,
}

#[derive(Default)]
struct RefreshGate {
    last_forced: Option<Instant>,
    /// 直近の取得完了時刻と成否。待機中のリクエストが結果を共有するために使う。
    last_completed: Option<(Instant, bool)>,
}

struct Inner {
    config: KeyResolverConfig,
    fetcher: Arc<dyn KeySetFetcher>,
    state: RwLock<KeyState>,
    gate: Mutex<RefreshGate>,
    next_version: AtomicU64,
    events: Arc<dyn EventSink>,
    cancel_token: CancellationToken,
}

/// KeyResolver は署名鍵セットの唯一の所有者。
#[derive(Clone)]
pub struct KeyResolver {
    inner: Arc<Inner>,
}

impl KeyResolver {
    pub fn new(
        fetcher: Arc<dyn KeySetFetcher>,
        config: KeyResolverConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                state: RwLock::new(KeyState::default()),
                gate: Mutex::new(RefreshGate::default()),
                next_version: AtomicU64::new(1),
                events,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &KeyResolverConfig {
        &self.inner.config
    }

    /// 最後に取得に成功した鍵セットを返す。ネットワークアクセスは行わない。
    pub fn current_keys(&self) -> Result<Arc<SigningKeySet>, KeySetError> {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let current = state.current.as_ref().ok_or(KeySetError::NoKeysAvailable)?;
        self.check_staleness(current)?;
        Ok(Arc::clone(current))
    }

    /// kid に一致する有効な鍵を探す。現行セットを優先し、猶予期間内なら直前のセットも参照する。
    pub fn find_key(&self, kid: &str) -> Result<Option<Arc<SigningKey>>, KeySetError> {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let current = state.current.as_ref().ok_or(KeySetError::NoKeysAvailable)?;
        self.check_staleness(current)?;

        if let Some(key) = current.find(kid) {
            return Ok(Some(key));
        }
        Ok(state
            .previous
            .as_ref()
            .filter(|(_, retained_until)| Instant::now() < *retained_until)
            .and_then(|(set, _)| set.find(kid)))
    }

    fn check_staleness(&self, set: &SigningKeySet) -> Result<(), KeySetError> {
        let age = set.fetched_at.elapsed();
        if age > self.inner.config.max_staleness {
            return Err(KeySetError::KeysExpired {
                age_secs: age.as_secs(),
            });
        }
        Ok(())
    }

    /// 鍵セットを取得して差し替える（定期更新・起動時の初回取得で使用）。
    pub async fn refresh(&self) -> Result<Arc<SigningKeySet>, KeySetError> {
        let mut gate = self.inner.gate.lock().await;
        let result = Self::fetch_and_swap(&self.inner, false).await;
        gate.last_completed = Some((Instant::now(), result.is_ok()));
        result
    }

    /// 未知の kid を検出した際の強制更新。
    ///
    /// 取得は切り離したタスクで実行するため、呼び出し元がキャンセルされても更新は完走する。
    pub async fn force_refresh(&self) -> ForcedRefresh {
        let inner = Arc::clone(&self.inner);
        let requested_at = Instant::now();
        let handle = tokio::spawn(async move { Self::forced_refresh(&inner, requested_at).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "forced key refresh task failed");
                ForcedRefresh::Failed
            }
        }
    }

    async fn forced_refresh(inner: &Inner, requested_at: Instant) -> ForcedRefresh {
        let mut gate = inner.gate.lock().await;

        // 待機中に別の取得が完了していればその結果を共有する
        if let Some((completed_at, ok)) = gate.last_completed {
            if completed_at >= requested_at {
                return if ok {
                    ForcedRefresh::Refreshed
                } else {
                    ForcedRefresh::Failed
                };
            }
        }

        if let Some(last) = gate.last_forced {
            if last.elapsed() < inner.config.forced_refresh_min_interval {
                inner.events.emit(&GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Throttled,
                    forced: true,
                    key_count: None,
                    error: None,
                });
                return ForcedRefresh::Throttled;
            }
        }

        gate.last_forced = Some(Instant::now());
        let result = Self::fetch_and_swap(inner, true).await;
        gate.last_completed = Some((Instant::now(), result.is_ok()));
        if result.is_ok() {
            ForcedRefresh::Refreshed
        } else {
            ForcedRefresh::Failed
        }
    }

    async fn fetch_and_swap(inner: &Inner, forced: bool) -> Result<Arc<SigningKeySet>, KeySetError> {
        let timeout = inner.config.fetch_timeout;
        let fetched = match tokio::time::timeout(timeout, inner.fetcher.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(KeySetError::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        let result = fetched.and_then(|doc| parse_document(&doc)).map(|keys| {
            let version = inner.next_version.fetch_add(1, Ordering::SeqCst);
            let set = Arc::new(SigningKeySet::new(version, keys));
            let mut state = inner.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = state.current.replace(Arc::clone(&set)) {
                let now = Instant::now();
                let grace = inner.config.rotation_grace.min(MAX_ROTATION_GRACE);
                state.previous = Some((old, now.checked_add(grace).unwrap_or(now)));
            }
            set
        });

        match &result {
            Ok(set) => {
                tracing::debug!(version = set.version, kids = ?set.kids(), "signing key set swapped");
                inner.events.emit(&GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Success,
                    forced,
                    key_count: Some(set.len()),
                    error: None,
                });
            }
            Err(e) => {
                inner.events.emit(&GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Failure,
                    forced,
                    key_count: None,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    /// 定期更新タスクを起動する。`shutdown` で停止する。
    pub fn spawn_refresh_task(&self) -> JoinHandle<()> {
        let resolver = self.clone();
        let token = self.inner.cancel_token.clone();
        let interval = self.inner.config.refresh_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = resolver.refresh().await {
                            tracing::warn!(error = %e, "scheduled key refresh failed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::JwkDocument;
    use k1s0_telemetry::NoopEventSink;
    use k1s0_test_helper::{jwks_document, RecordingEventSink, TestKeyPair};
    use std::sync::atomic::AtomicU32;

    /// 応答を差し替え可能で、取得回数を記録するフェッチャー。
    struct ScriptedFetcher {
        doc: std::sync::Mutex<Option<serde_json::Value>>,
        delay: Duration,
        count: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(doc: Option<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                doc: std::sync::Mutex::new(doc),
                delay: Duration::ZERO,
                count: AtomicU32::new(0),
            })
        }

        fn slow(doc: serde_json::Value, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                doc: std::sync::Mutex::new(Some(doc)),
                delay,
                count: AtomicU32::new(0),
            })
        }

        fn set(&self, doc: Option<serde_json::Value>) {
            *self.doc.lock().unwrap() = doc;
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl KeySetFetcher for ScriptedFetcher {
        async fn fetch(&self) -> Result<JwkDocument, KeySetError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let doc = self.doc.lock().unwrap().clone();
            match doc {
                Some(v) => Ok(serde_json::from_value(v).unwrap()),
                None => Err(KeySetError::Fetch("connection refused".into())),
            }
        }
    }

    fn config() -> KeyResolverConfig {
        KeyResolverConfig {
            refresh_interval: Duration::from_millis(50),
            fetch_timeout: Duration::from_millis(200),
            forced_refresh_min_interval: Duration::from_millis(100),
            max_staleness: Duration::from_secs(60),
            rotation_grace: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_no_keys_before_first_fetch() {
        let resolver = KeyResolver::new(ScriptedFetcher::new(None), config(), Arc::new(NoopEventSink));
        assert_eq!(
            resolver.current_keys().unwrap_err(),
            KeySetError::NoKeysAvailable
        );
        assert_eq!(
            resolver.find_key("k1").unwrap_err(),
            KeySetError::NoKeysAvailable
        );
    }

    #[tokio::test]
    async fn test_refresh_swaps_set_and_bumps_version() {
        let k1 = TestKeyPair::rsa("k1");
        let k2 = TestKeyPair::rsa("k2");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let resolver = KeyResolver::new(fetcher.clone(), config(), Arc::new(NoopEventSink));

        let first = resolver.refresh().await.unwrap();
        assert_eq!(first.kids(), vec!["k1"]);

        fetcher.set(Some(jwks_document(&[&k2])));
        let second = resolver.refresh().await.unwrap();
        assert!(second.version > first.version);
        assert_eq!(resolver.current_keys().unwrap().kids(), vec!["k2"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_last_known_good() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let events = Arc::new(RecordingEventSink::new());
        let resolver = KeyResolver::new(fetcher.clone(), config(), events.clone());

        resolver.refresh().await.unwrap();
        fetcher.set(None);
        assert!(resolver.refresh().await.is_err());

        assert!(resolver.find_key("k1").unwrap().is_some());
        assert_eq!(
            events.count(|e| matches!(
                e,
                GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Failure,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_staleness_ceiling() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let cfg = KeyResolverConfig {
            max_staleness: Duration::from_millis(50),
            ..config()
        };
        let resolver = KeyResolver::new(fetcher.clone(), cfg, Arc::new(NoopEventSink));

        resolver.refresh().await.unwrap();
        fetcher.set(None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = resolver.refresh().await;

        assert!(matches!(
            resolver.current_keys(),
            Err(KeySetError::KeysExpired { .. })
        ));
        assert!(matches!(
            resolver.find_key("k1"),
            Err(KeySetError::KeysExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_forced_refresh_is_throttled() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let events = Arc::new(RecordingEventSink::new());
        let resolver = KeyResolver::new(fetcher.clone(), config(), events.clone());

        assert_eq!(resolver.force_refresh().await, ForcedRefresh::Refreshed);
        assert_eq!(resolver.force_refresh().await, ForcedRefresh::Throttled);
        assert_eq!(fetcher.count(), 1);
        assert_eq!(
            events.count(|e| matches!(
                e,
                GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Throttled,
                    ..
                }
            )),
            1
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(resolver.force_refresh().await, ForcedRefresh::Refreshed);
        assert_eq!(fetcher.count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_forced_refresh_is_single_flight() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::slow(jwks_document(&[&k1]), Duration::from_millis(50));
        let resolver = KeyResolver::new(fetcher.clone(), config(), Arc::new(NoopEventSink));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move { r.force_refresh().await }));
        }
        for h in handles {
            let outcome = h.await.unwrap();
            assert_ne!(outcome, ForcedRefresh::Failed);
        }
        assert_eq!(fetcher.count(), 1);
        assert!(resolver.find_key("k1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::slow(jwks_document(&[&k1]), Duration::from_millis(500));
        let resolver = KeyResolver::new(fetcher, config(), Arc::new(NoopEventSink));

        assert!(matches!(
            resolver.refresh().await,
            Err(KeySetError::Timeout(200))
        ));
        assert!(resolver.current_keys().is_err());
    }

    #[tokio::test]
    async fn test_previous_set_usable_during_rotation_grace() {
        let k1 = TestKeyPair::rsa("k1");
        let k2 = TestKeyPair::rsa("k2");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let cfg = KeyResolverConfig {
            rotation_grace: Duration::from_millis(80),
            ..config()
        };
        let resolver = KeyResolver::new(fetcher.clone(), cfg, Arc::new(NoopEventSink));

        resolver.refresh().await.unwrap();
        fetcher.set(Some(jwks_document(&[&k2])));
        resolver.refresh().await.unwrap();

        assert!(resolver.find_key("k1").unwrap().is_some());
        assert!(resolver.find_key("k2").unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(resolver.find_key("k1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_rotation_grace_is_clamped() {
        let k1 = TestKeyPair::rsa("k1");
        let k2 = TestKeyPair::rsa("k2");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let cfg = KeyResolverConfig {
            rotation_grace: Duration::MAX,
            ..config()
        };
        let resolver = KeyResolver::new(fetcher.clone(), cfg, Arc::new(NoopEventSink));

        resolver.refresh().await.unwrap();
        fetcher.set(Some(jwks_document(&[&k2])));
        resolver.refresh().await.unwrap();
        assert!(resolver.find_key("k1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forced_refresh_completes_after_caller_is_cancelled() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::slow(jwks_document(&[&k1]), Duration::from_millis(80));
        let events = Arc::new(RecordingEventSink::new());
        let resolver = KeyResolver::new(fetcher.clone(), config(), events.clone());

        let caller = {
            let r = resolver.clone();
            tokio::spawn(async move { r.force_refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fetcher.count(), 1);
        assert!(resolver.find_key("k1").unwrap().is_some());
        assert_eq!(
            events.count(|e| matches!(
                e,
                GatewayEvent::KeyRefresh {
                    outcome: KeyRefreshOutcome::Success,
                    forced: true,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_background_refresh_task() {
        let k1 = TestKeyPair::rsa("k1");
        let fetcher = ScriptedFetcher::new(Some(jwks_document(&[&k1])));
        let resolver = KeyResolver::new(fetcher.clone(), config(), Arc::new(NoopEventSink));

        let handle = resolver.spawn_refresh_task();
        tokio::time::sleep(Duration::from_millis(180)).await;
        resolver.shutdown();
        handle.await.unwrap();

        assert!(fetcher.count() >= 2);
        assert!(resolver.current_keys().is_ok());
    }
}
