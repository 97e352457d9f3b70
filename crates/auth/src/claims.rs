//! ClaimSet: 検証済み資格情報の内容。

use serde::Deserialize;
use std::collections::HashMap;

/// RealmAccess は realm_access Claim を表す。
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Access はリソースアクセスのロール一覧を表す。
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Access {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// ClaimSet は検証に成功した資格情報のクレーム。1 リクエストの間だけ使われ、変更されない。
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimSet {
    /// 主体の一意識別子
    pub sub: String,

    /// 発行者。欠落時は空文字列となり発行者検証で拒否される
    #[serde(default)]
    pub iss: String,

    #[serde(default)]
    pub aud: Audience,

    /// 有効期限（Unix 秒）
    pub exp: u64,

    /// 発行時刻（Unix 秒）
    #[serde(default)]
    pub iat: Option<u64>,

    #[serde(default)]
    pub nbf: Option<u64>,

    #[serde(default)]
    pub jti: Option<String>,

    #[serde(default)]
    pub preferred_username: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub realm_access: Option<RealmAccess>,

    #[serde(default)]
    pub resource_access: Option<HashMap<String, Access>>,

    /// 上記以外のクレーム
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Audience は aud クレーム。単一の文字列と文字列配列のどちらの表現も受け付ける。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "AudienceRepr")]
pub struct Audience(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Multiple(Vec<String>),
}

impl From<AudienceRepr> for Audience {
    fn from(repr: AudienceRepr) -> Self {
        match repr {
            AudienceRepr::Single(aud) => Audience(vec![aud]),
            AudienceRepr::Multiple(auds) => Audience(auds),
        }
    }
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        self.0.iter().any(|a| a == audience)
    }
}

impl ClaimSet {
    /// 最初のオーディエンスを返す。
    pub fn audience(&self) -> Option<&str> {
        self.aud.0.first().map(String::as_str)
    }

    /// realm_access のロール一覧を返す。
    pub fn realm_roles(&self) -> &[String] {
        self.realm_access
            .as_ref()
            .map_or(&[], |ra| ra.roles.as_slice())
    }

    /// 指定リソースのロール一覧を返す。
    pub fn resource_roles(&self, resource: &str) -> &[String] {
        self.resource_access
            .as_ref()
            .and_then(|ra| ra.get(resource))
            .map_or(&[], |a| a.roles.as_slice())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.realm_roles().iter().any(|r| r == role)
    }

    /// 追加クレームを取得する。
    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.extra.get(name)
    }
}

impl std::fmt::Display for ClaimSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClaimSet{{sub={}, iss={}, aud={:?}, username={:?}}}",
            self.sub,
            self.iss,
            self.audience(),
            self.preferred_username,
        )
    }
}
