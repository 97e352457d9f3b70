//! CredentialVerifier: 署名鍵セットで JWT を検証する。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use k1s0_keyset::{ForcedRefresh, KeyResolver, SigningKey, ACCEPTED_ALGORITHMS};
use k1s0_telemetry::{EventSink, GatewayEvent};

use crate::claims::ClaimSet;
use crate::error::VerificationError;

/// CredentialVerifier は資格情報の署名・有効期間・発行者・オーディエンスを検証する。
///
/// 検証に使うアルゴリズムは常に鍵側に束縛されたものであり、トークンヘッダーの alg は
/// それと一致する場合にのみ受け付ける。
#[derive(Clone)]
pub struct CredentialVerifier {
    resolver: KeyResolver,
    clock_skew: Duration,
    events: Arc<dyn EventSink>,
}

impl CredentialVerifier {
    pub fn new(resolver: KeyResolver, clock_skew: Duration, events: Arc<dyn EventSink>) -> Self {
        Self {
            resolver,
            clock_skew,
            events,
        }
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// JWT を検証し ClaimSet を返す。失敗時にクレームの一部が返ることはない。
    pub async fn verify(
        &self,
        credential: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> Result<ClaimSet, VerificationError> {
        let result = self
            .verify_inner(credential, expected_issuer, expected_audience)
            .await;
        if let Err(e) = &result {
            tracing::debug!(kind = e.kind(), error = %e, "credential verification failed");
            self.events
                .emit(&GatewayEvent::VerificationFailed { kind: e.kind() });
        }
        result
    }

    async fn verify_inner(
        &self,
        credential: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> Result<ClaimSet, VerificationError> {
        let header =
            decode_header(credential).map_err(|e| classify_header_error(credential, &e))?;
        let kid = header
            .kid
            .ok_or_else(|| VerificationError::Malformed("missing kid in header".into()))?;

        let key = self.resolve_key(&kid).await?;

        let algorithm = key.algorithm.ok_or_else(|| {
            VerificationError::UnsupportedAlgorithm(format!("key {kid} has no bound algorithm"))
        })?;
        if header.alg != algorithm {
            return Err(VerificationError::UnsupportedAlgorithm(format!(
                "credential alg {:?} does not match key {kid} ({algorithm:?})",
                header.alg
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<ClaimSet>(credential, &key.key, &validation)?.claims;

        if claims.iss != expected_issuer {
            return Err(VerificationError::IssuerMismatch(claims.iss));
        }
        if !claims.aud.contains(expected_audience) {
            return Err(VerificationError::AudienceMismatch);
        }
        Ok(claims)
    }

    /// kid に対応する鍵を探す。見つからなければ強制更新を 1 回だけ行い、再度 1 回だけ探す。
    async fn resolve_key(&self, kid: &str) -> Result<Arc<SigningKey>, VerificationError> {
        if let Some(key) = self.resolver.find_key(kid)? {
            return Ok(key);
        }

        match self.resolver.force_refresh().await {
            ForcedRefresh::Refreshed => {}
            outcome => tracing::debug!(kid, ?outcome, "forced key refresh did not complete"),
        }

        self.resolver
            .find_key(kid)?
            .ok_or_else(|| VerificationError::UnknownKey(kid.to_string()))
    }
}

/// ヘッダーのデコード失敗を分類する。
///
/// JSON オブジェクトとして読めるヘッダーで `alg` が無い、または受理しない値
/// (`none` など) の場合は UnsupportedAlgorithm、それ以外は Malformed とする。
fn classify_header_error(
    credential: &str,
    err: &jsonwebtoken::errors::Error,
) -> VerificationError {
    let malformed = || VerificationError::Malformed(format!("invalid header: {err}"));

    let segments: Vec<&str> = credential.split('.').collect();
    if segments.len() != 3 {
        return malformed();
    }
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(segments[0]) else {
        return malformed();
    };
    let Ok(serde_json::Value::Object(header)) = serde_json::from_slice(&bytes) else {
        return malformed();
    };

    match header.get("alg").and_then(|v| v.as_str()) {
        None => VerificationError::UnsupportedAlgorithm("missing alg in header".into()),
        Some(alg) => match Algorithm::from_str(alg) {
            Ok(a) if ACCEPTED_ALGORITHMS.contains(&a) => malformed(),
            _ => VerificationError::UnsupportedAlgorithm(format!("alg {alg} is not accepted")),
        },
    }
}
