//! k1s0-test-helper: ゲートウェイのテスト用フィクスチャ。
//!
//! 実際の RS256 署名付きトークン・JWKS ドキュメント・イベント記録シンクを提供する。

pub mod events;
pub mod jwt;

pub use events::RecordingEventSink;
pub use jwt::{jwks_document, sign_hs256, TestClaims, TestKeyPair, TEST_AUDIENCE, TEST_ISSUER};
