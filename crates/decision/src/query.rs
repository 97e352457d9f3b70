use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// DecisionQuery は認可判定の問い合わせ内容。
///
/// context は BTreeMap で保持するため、キーの並びは常に安定している。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DecisionQuery {
    pub subject: String,
    pub action: String,
    pub resource: String,
    pub context: BTreeMap<String, String>,
}

impl DecisionQuery {
    pub fn new(
        subject: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            action: action.into(),
            resource: resource.into(),
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_context_map(mut self, context: BTreeMap<String, String>) -> Self {
        self.context.extend(context);
        self
    }

    /// ポリシーバージョンを含むキャッシュキー（SHA-256 の 16 進表記）を返す。
    ///
    /// 各フィールドは長さを前置して連結するため、区切りの異なる入力が衝突することはない。
    pub fn cache_key(&self, policy_version: &str) -> String {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        };
        field(policy_version);
        field(&self.subject);
        field(&self.action);
        field(&self.resource);
        for (key, value) in &self.context {
            field(key);
            field(value);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_stable_across_context_order() {
        let a = DecisionQuery::new("bob", "GET", "/data")
            .with_context("tenant", "acme")
            .with_context("region", "jp");
        let b = DecisionQuery::new("bob", "GET", "/data")
            .with_context("region", "jp")
            .with_context("tenant", "acme");
        assert_eq!(a.cache_key("1"), b.cache_key("1"));
        assert_eq!(a.cache_key("1").len(), 64);
    }

    #[test]
    fn test_cache_key_depends_on_policy_version() {
        let q = DecisionQuery::new("bob", "GET", "/data");
        assert_ne!(q.cache_key("1"), q.cache_key("2"));
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let a = DecisionQuery::new("bo", "bGET", "/data");
        let b = DecisionQuery::new("bob", "GET", "/data");
        assert_ne!(a.cache_key("1"), b.cache_key("1"));

        let c = DecisionQuery::new("bob", "GET", "/data").with_context("a", "bc");
        let d = DecisionQuery::new("bob", "GET", "/data").with_context("ab", "c");
        assert_ne!(c.cache_key("1"), d.cache_key("1"));
    }
}
