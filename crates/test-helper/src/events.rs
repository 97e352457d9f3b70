use std::sync::{Mutex, PoisonError};

use k1s0_telemetry::{EventSink, GatewayEvent};

/// 発行されたイベントを記録するテスト用シンク。
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録済みイベントのスナップショットを返す。
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 条件に一致するイベント数を返す。
    pub fn count(&self, pred: impl Fn(&GatewayEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &GatewayEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
