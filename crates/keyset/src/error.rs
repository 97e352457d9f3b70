/// KeySetError は署名鍵セットの取得・参照に関するエラーを表す。
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeySetError {
    /// 一度も鍵セットの取得に成功していない。
    #[error("no signing keys available")]
    NoKeysAvailable,

    /// 最後に取得に成功した鍵セットが許容される古さの上限を超えた。
    #[error("signing keys expired: last successful refresh {age_secs}s ago")]
    KeysExpired { age_secs: u64 },

    #[error("key set fetch failed: {0}")]
    Fetch(String),

    #[error("key set fetch timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid key set: {0}")]
    InvalidKeySet(String),
}
