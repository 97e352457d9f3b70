//! k1s0-decision: 外部ポリシーエンジンへの認可判定の問い合わせ。
//!
//! - [`DecisionCache`]: 鮮度期限（soft）と有効期限（hard）を持つ LRU キャッシュ
//! - [`OpaPolicyEngine`]: OPA Data API クライアント
//! - [`DecisionClient`]: キャッシュ参照・タイムアウト・1 回の再試行・サーキットブレーカー・stale 応答

pub mod cache;
pub mod client;
pub mod engine;
pub mod query;
pub mod result;
pub mod retry;

pub use cache::{CacheError, DecisionCache, DecisionCacheConfig, MAX_TTL};
pub use client::{DecisionClient, DecisionClientConfig, DecisionError};
#[cfg(feature = "mock")]
pub use engine::MockPolicyEngine;
pub use engine::{EngineDecision, OpaPolicyEngine, PolicyEngine, PolicyEngineError};
pub use query::DecisionQuery;
pub use result::{DecisionResult, Freshness};
pub use retry::RetryConfig;
