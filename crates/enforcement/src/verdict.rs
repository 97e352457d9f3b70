use serde::{Deserialize, Serialize};

/// ポリシーエンジンが利用できないときに適用する判定。
///
/// 暗黙の既定値は持たない。設定または構築時に必ず明示する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultVerdict {
    Allow,
    Deny,
}

impl DefaultVerdict {
    pub fn allows(self) -> bool {
        self == DefaultVerdict::Allow
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DefaultVerdict::Allow => "allow",
            DefaultVerdict::Deny => "deny",
        }
    }
}

/// 判定に至った終端状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// 資格情報の検証に失敗した（常に拒否）
    VerifyFailed,
    /// ポリシーエンジンまたはキャッシュの判定
    Decided,
    /// 判定が得られず既定値を適用した
    DefaultApplied,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::VerifyFailed => "verify_failed",
            Outcome::Decided => "decided",
            Outcome::DefaultApplied => "default_applied",
        }
    }
}

/// Verdict は authorize の結果。呼び出し側の監査ログに必要な情報をすべて持つ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allow: bool,
    pub reason: String,
    pub stale: bool,
    pub default_applied: bool,
    pub outcome: Outcome,
    pub subject: Option<String>,
}

impl Verdict {
    pub fn verify_failed(kind: &str) -> Self {
        Self {
            allow: false,
            reason: kind.to_string(),
            stale: false,
            default_applied: false,
            outcome: Outcome::VerifyFailed,
            subject: None,
        }
    }

    pub fn decided(subject: String, allow: bool, reason: String, stale: bool) -> Self {
        Self {
            allow,
            reason,
            stale,
            default_applied: false,
            outcome: Outcome::Decided,
            subject: Some(subject),
        }
    }

    /// 理由は `default_<allow|deny>:<判定エラー種別>` となる。
    pub fn default_applied(subject: String, default: DefaultVerdict, error_kind: &str) -> Self {
        Self {
            allow: default.allows(),
            reason: format!("default_{}:{error_kind}", default.as_str()),
            stale: false,
            default_applied: true,
            outcome: Outcome::DefaultApplied,
            subject: Some(subject),
        }
    }
}
