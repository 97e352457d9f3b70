//! ゲートウェイプロセスのログ出力初期化。
//! フィルタは設定ファイルの observability.log.level、出力形式は format で選ぶ。
//!
//! # 使用例
//!
//! ```ignore
//! use k1s0_telemetry::logger::init_logger;
//!
//! init_logger(tracing::Level::INFO, "json")?;
//! tracing::info!(kid = "k1", "signing key set refreshed");
//! ```

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
    #[error("global subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// init_logger は tracing-subscriber を初期化する。
///
/// `level` が既定の出力レベルとなる。`RUST_LOG` が設定されていればモジュール単位の指定で上書きできる。
/// format が "text" の場合はプレーンテキスト出力、それ以外は JSON 出力。
pub fn init_logger(level: Level, format: &str) -> Result<(), LoggerError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    let result = if format == "text" {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(fmt::format::FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(fmt::format::FmtSpan::CLOSE),
            )
            .try_init()
    };

    result.map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
}

/// parse_log_level は設定ファイルのログレベル文字列を tracing の Level に変換する。
/// 受け付けるのは trace / debug / info / warn / error のみ。
pub fn parse_log_level(level: &str) -> Option<Level> {
    match level {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_log_level("warn"), Some(Level::WARN));
        assert_eq!(parse_log_level("error"), Some(Level::ERROR));
        assert_eq!(parse_log_level("unknown"), None);
        assert_eq!(parse_log_level("k1s0_decision=debug,info"), None);
    }

    #[test]
    fn test_init_logger_twice_returns_error() {
        // 1 回目は他テストの初期化状況により成否が変わるため結果を問わない
        let _ = init_logger(Level::INFO, "text");
        let second = init_logger(Level::INFO, "json");
        assert!(matches!(second, Err(LoggerError::AlreadyInitialized(_))));
    }
}
