//! k1s0-enforcement: トークン検証とポリシー判定を行うゲートウェイコア。
//!
//! 周辺の要求処理層は [`EnforcementCore::authorize`] だけを呼び出す。トランスポートの解釈
//! （ヘッダーからの資格情報抽出、HTTP メソッド・パスの取り出し）は呼び出し側の責務。
//!
//! # 使い方
//!
//! ```ignore
//! use k1s0_enforcement::{config, EnforcementCore};
//! use k1s0_telemetry::TracingEventSink;
//! use std::sync::Arc;
//!
//! let cfg = config::load_validated("config/gateway.yaml", Some("config/gateway.prod.yaml"))?;
//! let core = EnforcementCore::from_config(&cfg, Arc::new(TracingEventSink))?;
//! core.start().await;
//!
//! let verdict = core.authorize(token, "GET", "/data", &context).await;
//! ```

pub mod builder;
pub mod config;
pub mod gateway;
pub mod verdict;

pub use builder::{init_tracing, BuildError};
pub use config::{load, load_validated, validate, ConfigError, GatewayConfig};
pub use gateway::{build_query, EnforcementCore, EnforcementSettings};
pub use verdict::{DefaultVerdict, Outcome, Verdict};
