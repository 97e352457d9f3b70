//! ゲートウェイ各コンポーネントが発行する構造化イベント。
//!
//! 鍵更新結果・検証失敗・判定キャッシュ・サーキットブレーカー遷移・最終判定の 5 種類を
//! `EventSink` 経由で外部のログ／メトリクス収集側へ渡す。

use std::fmt;
use std::sync::Arc;

/// 鍵セット更新の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRefreshOutcome {
    Success,
    Failure,
    /// 強制更新が最小間隔内のため抑止された。
    Throttled,
}

impl KeyRefreshOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyRefreshOutcome::Success => "success",
            KeyRefreshOutcome::Failure => "failure",
            KeyRefreshOutcome::Throttled => "throttled",
        }
    }
}

/// 判定キャッシュの参照結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    StaleServe,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::StaleServe => "stale_serve",
        }
    }
}

/// GatewayEvent はゲートウェイコアが発行する観測イベント。
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    KeyRefresh {
        outcome: KeyRefreshOutcome,
        forced: bool,
        key_count: Option<usize>,
        error: Option<String>,
    },
    VerificationFailed {
        kind: &'static str,
    },
    DecisionCache {
        outcome: CacheOutcome,
    },
    CircuitTransition {
        name: String,
        from: &'static str,
        to: &'static str,
    },
    VerdictIssued {
        allow: bool,
        reason: String,
        outcome: &'static str,
        stale: bool,
        default_applied: bool,
        subject: Option<String>,
    },
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::KeyRefresh {
                outcome, forced, ..
            } => write!(f, "key_refresh({}, forced={})", outcome.as_str(), forced),
            GatewayEvent::VerificationFailed { kind } => write!(f, "verification_failed({kind})"),
            GatewayEvent::DecisionCache { outcome } => {
                write!(f, "decision_cache({})", outcome.as_str())
            }
            GatewayEvent::CircuitTransition { name, from, to } => {
                write!(f, "circuit_transition({name}: {from} -> {to})")
            }
            GatewayEvent::VerdictIssued { allow, reason, .. } => {
                write!(f, "verdict(allow={allow}, reason={reason})")
            }
        }
    }
}

/// EventSink は観測イベントの受け口。
///
/// リクエスト処理経路から同期的に呼ばれるため、実装は I/O でブロックしてはならず、
/// 失敗を呼び出し元へ返してはならない。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &GatewayEvent);
}

/// TracingEventSink はイベントを tracing の構造化ログとして出力するデフォルト実装。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::KeyRefresh {
                outcome: KeyRefreshOutcome::Success,
                forced,
                key_count,
                ..
            } => {
                tracing::info!(forced, key_count = ?key_count, "signing key set refreshed");
            }
            GatewayEvent::KeyRefresh {
                outcome: KeyRefreshOutcome::Failure,
                forced,
                error,
                ..
            } => {
                tracing::warn!(
                    forced,
                    error = error.as_deref().unwrap_or("unknown"),
                    "signing key set refresh failed, keeping last known good set"
                );
            }
            GatewayEvent::KeyRefresh {
                outcome: KeyRefreshOutcome::Throttled,
                ..
            } => {
                tracing::debug!("forced key refresh throttled");
            }
            GatewayEvent::VerificationFailed { kind } => {
                tracing::info!(kind, "credential verification failed");
            }
            GatewayEvent::DecisionCache { outcome } => {
                tracing::debug!(outcome = outcome.as_str(), "decision cache lookup");
            }
            GatewayEvent::CircuitTransition { name, from, to } => {
                tracing::warn!(breaker = %name, from, to, "circuit breaker state changed");
            }
            GatewayEvent::VerdictIssued {
                allow,
                reason,
                outcome,
                stale,
                default_applied,
                subject,
            } => {
                tracing::info!(
                    allow,
                    reason = %reason,
                    outcome,
                    stale,
                    default_applied,
                    subject = subject.as_deref().unwrap_or("-"),
                    "authorization verdict"
                );
            }
        }
    }
}

/// NoopEventSink はすべてのイベントを破棄する。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &GatewayEvent) {}
}

/// FanoutEventSink は同じイベントを複数のシンクへ配信する。
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: &GatewayEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
