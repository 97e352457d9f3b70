//! 署名鍵と鍵セット。JWKS ドキュメントから検証用の鍵を組み立てる。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;

use crate::error::KeySetError;

/// 検証に使用を許可する非対称アルゴリズム。HS 系は鍵セットに載っていても受け付けない。
pub const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// JWKS レスポンスの構造体。
#[derive(Debug, Clone, Deserialize)]
pub struct JwkDocument {
    pub keys: Vec<Jwk>,
}

/// 個々の JWK 鍵。nbf / exp は鍵の有効期間を示す拡張フィールド（Unix 秒）。
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(rename = "use", default)]
    pub key_use: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// SigningKey は kid にアルゴリズムを明示的に束縛した検証鍵。
///
/// `algorithm` が None の鍵は保持するが、その鍵を指す資格情報は常に拒否される。
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Option<Algorithm>,
    pub key: DecodingKey,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// 指定時刻が鍵の有効期間内かを返す。
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |nbf| now >= nbf)
            && self.not_after.map_or(true, |exp| now <= exp)
    }

    /// JWK から鍵を組み立てる。署名用途でない鍵は Ok(None) を返す。
    pub fn from_jwk(jwk: &Jwk) -> Result<Option<Self>, KeySetError> {
        if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
            return Ok(None);
        }

        let kid = jwk
            .kid
            .clone()
            .ok_or_else(|| KeySetError::InvalidKeySet("JWK without kid".into()))?;

        if jwk.kty == "oct" || jwk.alg.as_deref().is_some_and(|a| a.starts_with("HS")) {
            return Err(KeySetError::InvalidKeySet(format!(
                "symmetric key {kid} is not accepted"
            )));
        }

        let key = decoding_key(jwk, &kid)?;
        let algorithm = jwk
            .alg
            .as_deref()
            .and_then(|a| Algorithm::from_str(a).ok())
            .filter(|a| ACCEPTED_ALGORITHMS.contains(a) && kty_matches(&jwk.kty, *a));

        Ok(Some(Self {
            kid,
            algorithm,
            key,
            not_before: jwk.nbf.and_then(timestamp),
            not_after: jwk.exp.and_then(timestamp),
        }))
    }
}

fn decoding_key(jwk: &Jwk, kid: &str) -> Result<DecodingKey, KeySetError> {
    let missing = |field: &str| KeySetError::InvalidKeySet(format!("{kid}: missing {field}"));
    let invalid = |e: jsonwebtoken::errors::Error| {
        KeySetError::InvalidKeySet(format!("{kid}: {e}"))
    };

    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or_else(|| missing("n"))?;
            let e = jwk.e.as_deref().ok_or_else(|| missing("e"))?;
            DecodingKey::from_rsa_components(n, e).map_err(invalid)
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or_else(|| missing("x"))?;
            let y = jwk.y.as_deref().ok_or_else(|| missing("y"))?;
            DecodingKey::from_ec_components(x, y).map_err(invalid)
        }
        "OKP" => {
            if jwk.crv.as_deref() != Some("Ed25519") {
                return Err(KeySetError::InvalidKeySet(format!(
                    "{kid}: unsupported curve {:?}",
                    jwk.crv
                )));
            }
            let x = jwk.x.as_deref().ok_or_else(|| missing("x"))?;
            DecodingKey::from_ed_components(x).map_err(invalid)
        }
        other => Err(KeySetError::InvalidKeySet(format!(
            "{kid}: unsupported key type {other}"
        ))),
    }
}

fn kty_matches(kty: &str, alg: Algorithm) -> bool {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => kty == "RSA",
        Algorithm::ES256 | Algorithm::ES384 => kty == "EC",
        Algorithm::EdDSA => kty == "OKP",
        _ => false,
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// SigningKeySet は一度の取得で得た鍵の不変スナップショット。
///
/// 更新時は新しいセットを丸ごと差し替えるため、読み手が部分的に更新された状態を見ることはない。
#[derive(Debug)]
pub struct SigningKeySet {
    pub version: u64,
    pub keys: Vec<Arc<SigningKey>>,
    pub fetched_at: Instant,
}

impl SigningKeySet {
    pub fn new(version: u64, keys: Vec<Arc<SigningKey>>) -> Self {
        Self {
            version,
            keys,
            fetched_at: Instant::now(),
        }
    }

    /// kid に一致し、現在有効な鍵を返す。
    pub fn find(&self, kid: &str) -> Option<Arc<SigningKey>> {
        let now = Utc::now();
        self.keys
            .iter()
            .find(|k| k.kid == kid && k.is_valid_at(now))
            .cloned()
    }

    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.kid.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// JWKS ドキュメントから使用可能な鍵を抽出する。
///
/// 個々の不正な鍵は警告ログを出して除外する。使用可能な鍵が 1 つも無い場合はエラー。
pub fn parse_document(doc: &JwkDocument) -> Result<Vec<Arc<SigningKey>>, KeySetError> {
    let mut keys = Vec::with_capacity(doc.keys.len());
    for jwk in &doc.keys {
        match SigningKey::from_jwk(jwk) {
            Ok(Some(key)) => keys.push(Arc::new(key)),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "skipping unusable JWK"),
        }
    }
    if keys.is_empty() {
        return Err(KeySetError::InvalidKeySet(
            "document contains no usable signing keys".into(),
        ));
    }
    Ok(keys)
}
