//! k1s0-auth: 資格情報（JWT）検証ライブラリ
//!
//! [`k1s0_keyset::KeyResolver`] が保持する署名鍵セットを使い、署名・有効期限・発行者・
//! オーディエンスを検証して [`ClaimSet`] を返す。
//!
//! # 使い方
//!
//! ```ignore
//! use k1s0_auth::CredentialVerifier;
//! use std::time::Duration;
//!
//! let verifier = CredentialVerifier::new(resolver, Duration::from_secs(30), events);
//! let claims = verifier
//!     .verify("eyJ...", "https://auth.example.com/realms/k1s0", "k1s0-api")
//!     .await?;
//! ```

pub mod claims;
pub mod error;
pub mod verifier;

pub use claims::{Access, Audience, ClaimSet, RealmAccess};
pub use error::VerificationError;
pub use verifier::CredentialVerifier;
