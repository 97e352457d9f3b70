use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use k1s0_telemetry::{EventSink, GatewayEvent, NoopEventSink};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Transition = (CircuitBreakerState, CircuitBreakerState);

struct Inner {
    state: CircuitBreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// 遷移のたびに進む世代。古い世代で発行された許可の結果は集計しない
    epoch: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitBreakerState) -> Transition {
        let from = self.state;
        self.state = to;
        self.epoch += 1;
        self.failure_count = 0;
        self.success_count = 0;
        self.trial_in_flight = false;
        self.opened_at = (to == CircuitBreakerState::Open).then(Instant::now);
        (from, to)
    }
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: Arc<dyn EventSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        tracing::info!(
            breaker = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "circuit breaker state changed"
        );
        self.events.emit(&GatewayEvent::CircuitTransition {
            name: self.name.clone(),
            from: from.as_str(),
            to: to.as_str(),
        });
    }

    fn maybe_half_open(&self, inner: &mut Inner) -> Option<Transition> {
        let elapsed = inner.opened_at.map(|t| t.elapsed())?;
        if inner.state == CircuitBreakerState::Open && elapsed >= self.config.open_timeout {
            return Some(inner.transition(CircuitBreakerState::HalfOpen));
        }
        None
    }

    fn resolve(&self, epoch: u64, trial: bool, success: bool) {
        let transition = {
            let mut inner = self.lock();
            if trial && inner.epoch == epoch {
                inner.trial_in_flight = false;
            }
            if inner.epoch != epoch {
                None
            } else if success {
                self.on_success(&mut inner)
            } else {
                self.on_failure(&mut inner)
            }
        };
        self.report(transition);
    }

    fn on_success(&self, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitBreakerState::HalfOpen => {
                inner.success_count += 1;
                (inner.success_count >= self.config.success_threshold)
                    .then(|| inner.transition(CircuitBreakerState::Closed))
            }
            CircuitBreakerState::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count += 1;
                (inner.failure_count >= self.config.failure_threshold)
                    .then(|| inner.transition(CircuitBreakerState::Open))
            }
            CircuitBreakerState::HalfOpen => Some(inner.transition(CircuitBreakerState::Open)),
            CircuitBreakerState::Open => None,
        }
    }

    fn release(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch {
            inner.trial_in_flight = false;
        }
    }
}

/// CircuitBreaker は連続失敗で Open になり、一定時間後に 1 件ずつの試行で回復を確かめる。
///
/// 状態遷移は 1 つのロック下で行われ、同じ遷移が二重に報告されることはない。
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_events(name, config, Arc::new(NoopEventSink))
    }

    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                inner: Mutex::new(Inner {
                    state: CircuitBreakerState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    opened_at: None,
                    trial_in_flight: false,
                    epoch: 0,
                }),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> CircuitBreakerState {
        let (state, transition) = {
            let mut inner = self.shared.lock();
            let transition = self.shared.maybe_half_open(&mut inner);
            (inner.state, transition)
        };
        self.shared.report(transition);
        state
    }

    /// 呼び出しの許可を得る。Open 中、または HalfOpen で試行が実行中の場合は None。
    pub fn try_acquire(&self) -> Option<CallPermit> {
        let (permit, transition) = {
            let mut inner = self.shared.lock();
            let transition = self.shared.maybe_half_open(&mut inner);
            let permit = match inner.state {
                CircuitBreakerState::Closed => Some(false),
                CircuitBreakerState::Open => None,
                CircuitBreakerState::HalfOpen if inner.trial_in_flight => None,
                CircuitBreakerState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            }
            .map(|trial| CallPermit {
                shared: Arc::clone(&self.shared),
                epoch: inner.epoch,
                trial,
                resolved: false,
            });
            (permit, transition)
        };
        self.shared.report(transition);
        permit
    }
}

/// CallPermit は 1 回の呼び出しに対する許可。`success` / `failure` で結果を報告する。
///
/// 結果を報告せずに破棄された場合（呼び出し元のキャンセルなど）は集計せず、試行枠だけを解放する。
pub struct CallPermit {
    shared: Arc<Shared>,
    epoch: u64,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.shared.resolve(self.epoch, self.trial, true);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.shared.resolve(self.epoch, self.trial, false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.shared.release(self.epoch);
        }
    }
}
