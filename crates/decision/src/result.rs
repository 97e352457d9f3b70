use chrono::{DateTime, Utc};
use serde::Serialize;

/// 判定結果の鮮度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// ポリシーエンジンの応答、または鮮度期限内のキャッシュ
    Live,
    /// 鮮度期限切れ・有効期限内のキャッシュを縮退時に返したもの
    Stale,
}

/// DecisionResult はポリシーエンジンの判定結果。キャッシュ内で書き換えられることはない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionResult {
    pub allowed: bool,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl DecisionResult {
    pub fn live(allowed: bool, reason: impl Into<String>) -> Self {
        Self {
            allowed,
            reason: reason.into(),
            decided_at: Utc::now(),
            freshness: Freshness::Live,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    /// 同じ判定を stale として複製する。
    #[must_use]
    pub fn into_stale(self) -> Self {
        Self {
            freshness: Freshness::Stale,
            ..self
        }
    }
}
