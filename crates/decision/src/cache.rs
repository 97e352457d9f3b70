//! DecisionCache は判定結果のインメモリキャッシュ。
//! moka::future::Cache を使用し、LRU で容量を制限する。
//!
//! 各エントリは鮮度期限（soft）と有効期限（hard）を持つ。hard を過ぎたエントリは
//! 縮退時であっても返さない。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::query::DecisionQuery;
use crate::result::DecisionResult;

/// エントリの期限に使う TTL の上限。これを超える TTL は上限に切り詰める。
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("hard TTL ({hard_ms}ms) must be greater than soft TTL ({soft_ms}ms)")]
    InvalidTtl { soft_ms: u128, hard_ms: u128 },
}

#[derive(Debug, Clone)]
pub struct DecisionCacheConfig {
    pub max_capacity: u64,
    pub soft_ttl: Duration,
    pub hard_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            soft_ttl: Duration::from_secs(5),
            hard_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    result: DecisionResult,
    soft_expires_at: Instant,
    hard_expires_at: Instant,
}

/// エントリごとの hard 期限を moka に伝える。
struct HardExpiry;

impl moka::Expiry<String, Arc<CacheEntry>> for HardExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.hard_expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.hard_expires_at.saturating_duration_since(updated_at))
    }
}

pub struct DecisionCache {
    inner: Cache<String, Arc<CacheEntry>>,
    soft_ttl: Duration,
    hard_ttl: Duration,
    sweep_interval: Duration,
    policy_version: RwLock<String>,
    /// 無効化のたびに進む世代
    generation: AtomicU64,
    /// 世代確認と挿入、世代更新と全削除をそれぞれ不可分にする
    write_gate: tokio::sync::RwLock<()>,
    cancel_token: CancellationToken,
}

impl DecisionCache {
    pub fn new(
        config: &DecisionCacheConfig,
        policy_version: impl Into<String>,
    ) -> Result<Self, CacheError> {
        validate_ttl(config.soft_ttl, config.hard_ttl)?;
        let inner = Cache::builder()
            .max_capacity(config.max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(HardExpiry)
            .build();
        Ok(Self {
            inner,
            soft_ttl: config.soft_ttl,
            hard_ttl: config.hard_ttl,
            sweep_interval: config.sweep_interval,
            policy_version: RwLock::new(policy_version.into()),
            generation: AtomicU64::new(0),
            write_gate: tokio::sync::RwLock::new(()),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn policy_version(&self) -> String {
        self.policy_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn key(&self, query: &DecisionQuery) -> String {
        query.cache_key(&self.policy_version())
    }

    async fn lookup(&self, query: &DecisionQuery) -> Option<Arc<CacheEntry>> {
        let key = self.key(query);
        let entry = self.inner.get(&key).await?;
        if Instant::now() >= entry.hard_expires_at {
            self.inner.invalidate(&key).await;
            return None;
        }
        Some(entry)
    }

    /// 鮮度期限内のエントリを返す。
    pub async fn get_fresh(&self, query: &DecisionQuery) -> Option<DecisionResult> {
        let entry = self.lookup(query).await?;
        (Instant::now() < entry.soft_expires_at).then(|| entry.result.clone())
    }

    /// 有効期限内のエントリを stale として返す。縮退時のみ使う。
    pub async fn get_stale(&self, query: &DecisionQuery) -> Option<DecisionResult> {
        let entry = self.lookup(query).await?;
        Some(entry.result.clone().into_stale())
    }

    /// 既定の TTL で格納する。
    pub async fn put(&self, query: &DecisionQuery, result: DecisionResult) {
        let _gate = self.write_gate.read().await;
        self.insert(query, result, self.soft_ttl, self.hard_ttl).await;
    }

    /// TTL を指定して格納する。hard は soft より長くなければならない。
    pub async fn put_with_ttl(
        &self,
        query: &DecisionQuery,
        result: DecisionResult,
        soft_ttl: Duration,
        hard_ttl: Duration,
    ) -> Result<(), CacheError> {
        validate_ttl(soft_ttl, hard_ttl)?;
        let _gate = self.write_gate.read().await;
        self.insert(query, result, soft_ttl, hard_ttl).await;
        Ok(())
    }

    /// `generation` 取得後に無効化が起きていなければ格納する。格納したかを返す。
    pub async fn put_if_generation(
        &self,
        query: &DecisionQuery,
        result: DecisionResult,
        generation: u64,
    ) -> bool {
        let _gate = self.write_gate.read().await;
        if self.generation() != generation {
            tracing::debug!(
                subject = %query.subject,
                "discarding decision fetched before cache invalidation"
            );
            return false;
        }
        self.insert(query, result, self.soft_ttl, self.hard_ttl).await;
        true
    }

    async fn insert(
        &self,
        query: &DecisionQuery,
        result: DecisionResult,
        soft_ttl: Duration,
        hard_ttl: Duration,
    ) {
        let now = Instant::now();
        let entry = CacheEntry {
            result,
            soft_expires_at: deadline(now, soft_ttl),
            hard_expires_at: deadline(now, hard_ttl),
        };
        self.inner.insert(self.key(query), Arc::new(entry)).await;
    }

    /// すべてのエントリを削除する。
    pub async fn invalidate_all(&self) {
        let _gate = self.write_gate.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate_all();
        // run_pending_tasks は moka 内部のクリーンアップをトリガーする
        self.inner.run_pending_tasks().await;
    }

    /// ポリシーバージョンを更新する。変更があればキャッシュ全体を無効化する。
    pub async fn set_policy_version(&self, version: &str) -> bool {
        {
            let mut current = self
                .policy_version
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *current == version {
                return false;
            }
            *current = version.to_string();
        }
        tracing::info!(policy_version = version, "policy version changed, invalidating decisions");
        self.invalidate_all().await;
        true
    }

    /// 期限切れエントリの掃除と LRU 追い出しを実行する。
    ///
    /// moka の期限管理はおよそ 1 秒単位のタイマーホイールで行われるため、hard 期限を過ぎた
    /// エントリが実際に削除されるまで最大 1 秒程度遅れる。参照時は期限を都度判定するので、
    /// 削除前のエントリが返ることはない。
    pub async fn run_sweep(&self) {
        self.inner.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// 定期掃除タスクを起動する。`shutdown` で停止する。
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let token = self.cancel_token.clone();
        let interval = self.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        cache.run_sweep().await;
                        tracing::trace!(entries = cache.entry_count(), "decision cache swept");
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// `now + ttl` を返す。TTL は `MAX_TTL` に切り詰め、加算できない場合は `now` とする。
fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

fn validate_ttl(soft_ttl: Duration, hard_ttl: Duration) -> Result<(), CacheError> {
    if hard_ttl <= soft_ttl {
        return Err(CacheError::InvalidTtl {
            soft_ms: soft_ttl.as_millis(),
            hard_ms: hard_ttl.as_millis(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(soft_ms: u64, hard_ms: u64) -> DecisionCacheConfig {
        DecisionCacheConfig {
            max_capacity: 100,
            soft_ttl: Duration::from_millis(soft_ms),
            hard_ttl: Duration::from_millis(hard_ms),
            sweep_interval: Duration::from_millis(20),
        }
    }

    fn bob() -> DecisionQuery {
        DecisionQuery::new("bob", "GET", "/data")
    }

    #[test]
    fn test_rejects_hard_ttl_not_above_soft() {
        assert!(matches!(
            DecisionCache::new(&config(100, 100), "1"),
            Err(CacheError::InvalidTtl { .. })
        ));
    }

    #[tokio::test]
    async fn test_fresh_then_stale_then_expired() {
        let cache = DecisionCache::new(&config(40, 150), "1").unwrap();
        cache.put(&bob(), DecisionResult::live(true, "policy_allow")).await;

        let fresh = cache.get_fresh(&bob()).await.unwrap();
        assert!(fresh.allowed);
        assert!(!fresh.is_stale());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get_fresh(&bob()).await.is_none());
        let stale = cache.get_stale(&bob()).await.unwrap();
        assert!(stale.allowed);
        assert!(stale.is_stale());
        assert_eq!(stale.decided_at, fresh.decided_at);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get_stale(&bob()).await.is_none());
    }

    #[tokio::test]
    async fn test_put_with_ttl_validates() {
        let cache = DecisionCache::new(&config(40, 150), "1").unwrap();
        let result = cache
            .put_with_ttl(
                &bob(),
                DecisionResult::live(true, "policy_allow"),
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(CacheError::InvalidTtl { .. })));
        assert!(cache.get_stale(&bob()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidation_prevents_resurrection() {
        let cache = DecisionCache::new(&config(1000, 5000), "1").unwrap();
        let snapshot = cache.generation();

        cache.invalidate_all().await;
        let stored = cache
            .put_if_generation(&bob(), DecisionResult::live(true, "policy_allow"), snapshot)
            .await;
        assert!(!stored);
        assert!(cache.get_stale(&bob()).await.is_none());

        let stored = cache
            .put_if_generation(
                &bob(),
                DecisionResult::live(true, "policy_allow"),
                cache.generation(),
            )
            .await;
        assert!(stored);
        assert!(cache.get_fresh(&bob()).await.is_some());
    }

    #[tokio::test]
    async fn test_policy_version_change_invalidates_globally() {
        let cache = DecisionCache::new(&config(1000, 5000), "1").unwrap();
        cache.put(&bob(), DecisionResult::live(true, "policy_allow")).await;
        let alice = DecisionQuery::new("alice", "GET", "/data");
        cache.put(&alice, DecisionResult::live(false, "policy_deny")).await;

        assert!(!cache.set_policy_version("1").await);
        assert!(cache.get_fresh(&bob()).await.is_some());

        assert!(cache.set_policy_version("2").await);
        assert_eq!(cache.policy_version(), "2");
        assert!(cache.get_stale(&bob()).await.is_none());
        assert!(cache.get_stale(&alice).await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cfg = DecisionCacheConfig {
            max_capacity: 2,
            ..config(1000, 5000)
        };
        let cache = DecisionCache::new(&cfg, "1").unwrap();
        for subject in ["a", "b", "c", "d"] {
            cache
                .put(
                    &DecisionQuery::new(subject, "GET", "/data"),
                    DecisionResult::live(true, "policy_allow"),
                )
                .await;
            cache.run_sweep().await;
        }
        assert!(cache.entry_count() <= 2);
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_entries() {
        let cache = Arc::new(DecisionCache::new(&config(10, 30), "1").unwrap());
        cache.put(&bob(), DecisionResult::live(true, "policy_allow")).await;
        cache.run_sweep().await;
        assert_eq!(cache.entry_count(), 1);

        // 期限切れの削除はタイマーホイールの刻み（約 1 秒）単位で行われる
        let handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        cache.shutdown();
        handle.await.unwrap();

        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let cfg = DecisionCacheConfig {
            soft_ttl: Duration::from_secs(u64::MAX - 1),
            hard_ttl: Duration::from_secs(u64::MAX),
            ..config(1000, 5000)
        };
        let cache = DecisionCache::new(&cfg, "1").unwrap();
        cache.put(&bob(), DecisionResult::live(true, "policy_allow")).await;
        assert!(cache.get_fresh(&bob()).await.unwrap().allowed);

        cache
            .put_with_ttl(
                &bob(),
                DecisionResult::live(false, "policy_deny"),
                Duration::from_secs(1),
                Duration::MAX,
            )
            .await
            .unwrap();
        assert!(!cache.get_stale(&bob()).await.unwrap().allowed);
    }
}
