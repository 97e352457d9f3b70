use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const TEST_ISSUER: &str = "https://auth.k1s0.internal.example.com/realms/k1s0";
pub const TEST_AUDIENCE: &str = "k1s0-api";

/// テスト用 JWT クレーム。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm_access: Option<Value>,
}

impl Default for TestClaims {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            sub: "user-uuid-1234".to_string(),
            iss: TEST_ISSUER.to_string(),
            aud: TEST_AUDIENCE.to_string(),
            exp: (now + Duration::minutes(15)).timestamp(),
            iat: now.timestamp(),
            nbf: None,
            preferred_username: None,
            realm_access: None,
        }
    }
}

impl TestClaims {
    /// 指定 subject・ユーザー名を持つクレームを生成する。
    pub fn for_user(sub: &str, username: &str) -> Self {
        Self {
            sub: sub.to_string(),
            preferred_username: Some(username.to_string()),
            realm_access: Some(json!({ "roles": ["user"] })),
            ..Default::default()
        }
    }
}

/// 同一 kid の鍵生成を 1 プロセス 1 回に抑えるための共有プール。
fn key_pool() -> &'static Mutex<HashMap<String, RsaPrivateKey>> {
    static POOL: OnceLock<Mutex<HashMap<String, RsaPrivateKey>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// テスト用 RSA 鍵ペア。JWK の公開と RS256 署名を行う。
#[derive(Clone)]
pub struct TestKeyPair {
    pub kid: String,
    private_key: RsaPrivateKey,
}

impl TestKeyPair {
    /// kid に対応する 2048bit RSA 鍵を返す。同じ kid は同じ鍵になる。
    pub fn rsa(kid: &str) -> Self {
        let mut pool = key_pool().lock().unwrap_or_else(PoisonError::into_inner);
        let private_key = pool
            .entry(kid.to_string())
            .or_insert_with(|| {
                RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation failed")
            })
            .clone();
        Self {
            kid: kid.to_string(),
            private_key,
        }
    }

    /// alg 付きの公開 JWK を返す。
    pub fn jwk(&self) -> Value {
        self.jwk_with_alg(Some("RS256"))
    }

    /// alg を指定（None なら省略）した公開 JWK を返す。
    pub fn jwk_with_alg(&self, alg: Option<&str>) -> Value {
        let public_key = self.private_key.to_public_key();
        let mut jwk = json!({
            "kid": self.kid,
            "kty": "RSA",
            "use": "sig",
            "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        });
        if let (Some(alg), Some(obj)) = (alg, jwk.as_object_mut()) {
            obj.insert("alg".to_string(), Value::String(alg.to_string()));
        }
        jwk
    }

    fn encoding_key(&self) -> EncodingKey {
        let pem = self
            .private_key
            .to_pkcs1_pem(LineEnding::LF)
            .expect("PEM encoding failed");
        EncodingKey::from_rsa_pem(pem.as_bytes()).expect("invalid RSA PEM")
    }

    /// RS256 で署名したトークンを返す。
    pub fn sign<T: Serialize>(&self, claims: &T) -> String {
        self.sign_with(Algorithm::RS256, claims)
    }

    /// 任意の RSA 系アルゴリズムで署名したトークンを返す。
    pub fn sign_with<T: Serialize>(&self, alg: Algorithm, claims: &T) -> String {
        let mut header = Header::new(alg);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key()).expect("token signing failed")
    }

    /// ヘッダーに kid を含めずに RS256 署名したトークンを返す。
    pub fn sign_without_kid<T: Serialize>(&self, claims: &T) -> String {
        encode(&Header::new(Algorithm::RS256), claims, &self.encoding_key())
            .expect("token signing failed")
    }
}

/// 鍵ペア群から JWKS ドキュメントを組み立てる。
pub fn jwks_document(keys: &[&TestKeyPair]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

/// 共有シークレットで HS256 署名したトークンを返す（アルゴリズム混同攻撃の再現用）。
pub fn sign_hs256<T: Serialize>(kid: &str, secret: &[u8], claims: &T) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    encode(&header, claims, &EncodingKey::from_secret(secret)).expect("token signing failed")
}
