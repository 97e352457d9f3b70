//! k1s0-telemetry: ゲートウェイコアの観測フック。
//!
//! 鍵更新・資格情報検証・判定キャッシュ・サーキットブレーカー・最終判定の各イベントを
//! [`EventSink`] 経由で発行する。既定では tracing の構造化ログへ出力し、
//! [`GatewayMetrics`] を併用すると Prometheus カウンタにも集計される。

pub mod events;
pub mod logger;
pub mod metrics;

pub use events::{
    CacheOutcome, EventSink, FanoutEventSink, GatewayEvent, KeyRefreshOutcome, NoopEventSink,
    TracingEventSink,
};
pub use logger::{init_logger, parse_log_level, LoggerError};
pub use metrics::GatewayMetrics;
