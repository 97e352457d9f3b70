//! k1s0-keyset: ID プロバイダの公開署名鍵セットを取得・保持する。
//!
//! [`KeyResolver`] が鍵セットの唯一の所有者となり、定期更新・未知 kid による強制更新・
//! ローテーション猶予・古さの上限を管理する。

pub mod error;
pub mod fetcher;
pub mod key;
pub mod resolver;

pub use error::KeySetError;
#[cfg(feature = "mock")]
pub use fetcher::MockKeySetFetcher;
pub use fetcher::{JwksHttpFetcher, KeySetFetcher};
pub use key::{parse_document, Jwk, JwkDocument, SigningKey, SigningKeySet, ACCEPTED_ALGORITHMS};
pub use resolver::{ForcedRefresh, KeyResolver, KeyResolverConfig, MAX_ROTATION_GRACE};
