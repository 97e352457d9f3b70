use k1s0_keyset::KeySetError;

/// VerificationError は資格情報検証の失敗理由を表す。いずれも終端エラーで、要求は拒否される。
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no signing keys available")]
    NoKeysAvailable,

    #[error("signing keys expired ({age_secs}s since last refresh)")]
    KeysExpired { age_secs: u64 },

    #[error("unknown key id: {0}")]
    UnknownKey(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("credential expired")]
    Expired,

    #[error("credential not yet valid")]
    NotYetValid,

    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("invalid signature")]
    InvalidSignature,
}

impl VerificationError {
    /// 監査ログ・メトリクスラベルに使う安定した種別名を返す。
    pub fn kind(&self) -> &'static str {
        match self {
            VerificationError::NoKeysAvailable => "no_keys_available",
            VerificationError::KeysExpired { .. } => "keys_expired",
            VerificationError::UnknownKey(_) => "unknown_key",
            VerificationError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            VerificationError::Expired => "expired",
            VerificationError::NotYetValid => "not_yet_valid",
            VerificationError::IssuerMismatch(_) => "issuer_mismatch",
            VerificationError::AudienceMismatch => "audience_mismatch",
            VerificationError::Malformed(_) => "malformed",
            VerificationError::InvalidSignature => "invalid_signature",
        }
    }
}

impl From<KeySetError> for VerificationError {
    fn from(e: KeySetError) -> Self {
        match e {
            KeySetError::KeysExpired { age_secs } => VerificationError::KeysExpired { age_secs },
            // 参照系で返るのは上記と NoKeysAvailable のみ。取得系エラーも鍵が無い扱いにする
            KeySetError::NoKeysAvailable
            | KeySetError::Fetch(_)
            | KeySetError::Timeout(_)
            | KeySetError::InvalidKeySet(_) => VerificationError::NoKeysAvailable,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match e.kind() {
            ErrorKind::ExpiredSignature => VerificationError::Expired,
            ErrorKind::ImmatureSignature => VerificationError::NotYetValid,
            ErrorKind::InvalidIssuer => VerificationError::IssuerMismatch(e.to_string()),
            ErrorKind::InvalidAudience => VerificationError::AudienceMismatch,
            ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
                VerificationError::UnsupportedAlgorithm(e.to_string())
            }
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::RsaFailedSigning
            | ErrorKind::Crypto(_) => VerificationError::InvalidSignature,
            _ => VerificationError::Malformed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::{Error, ErrorKind};

    #[test]
    fn test_jwt_error_mapping() {
        let cases = [
            (ErrorKind::ExpiredSignature, "expired"),
            (ErrorKind::ImmatureSignature, "not_yet_valid"),
            (ErrorKind::InvalidSignature, "invalid_signature"),
            (ErrorKind::InvalidToken, "malformed"),
            (ErrorKind::MissingRequiredClaim("exp".into()), "malformed"),
        ];
        for (kind, expected) in cases {
            assert_eq!(VerificationError::from(Error::from(kind)).kind(), expected);
        }
    }

    #[test]
    fn test_keyset_error_mapping() {
        assert_eq!(
            VerificationError::from(KeySetError::KeysExpired { age_secs: 7200 }),
            VerificationError::KeysExpired { age_secs: 7200 }
        );
        assert_eq!(
            VerificationError::from(KeySetError::NoKeysAvailable).kind(),
            "no_keys_available"
        );
    }
}
