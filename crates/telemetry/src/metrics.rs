use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::events::{EventSink, GatewayEvent};

/// GatewayMetrics はゲートウェイイベントを Prometheus カウンタへ集計する EventSink。
pub struct GatewayMetrics {
    pub key_refresh_total: IntCounterVec,
    pub verification_failures_total: IntCounterVec,
    pub decision_cache_total: IntCounterVec,
    pub circuit_transitions_total: IntCounterVec,
    pub circuit_open: IntGaugeVec,
    pub verdicts_total: IntCounterVec,
    registry: Registry,
}

impl GatewayMetrics {
    /// new は専用 Registry にメトリクスを登録して返す。
    /// service_name はメトリクスの service ラベルに使用される。
    pub fn new(service_name: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let key_refresh_total = IntCounterVec::new(
            Opts::new("k1s0_key_refresh_total", "Signing key set refresh attempts")
                .const_label("service", service_name),
            &["outcome", "forced"],
        )?;
        let verification_failures_total = IntCounterVec::new(
            Opts::new(
                "k1s0_credential_verification_failures_total",
                "Rejected credentials by error kind",
            )
            .const_label("service", service_name),
            &["kind"],
        )?;
        let decision_cache_total = IntCounterVec::new(
            Opts::new("k1s0_decision_cache_total", "Decision cache lookups")
                .const_label("service", service_name),
            &["outcome"],
        )?;
        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "k1s0_circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            )
            .const_label("service", service_name),
            &["name", "from", "to"],
        )?;
        let circuit_open = IntGaugeVec::new(
            Opts::new(
                "k1s0_circuit_breaker_open",
                "1 while the circuit breaker is not closed",
            )
            .const_label("service", service_name),
            &["name"],
        )?;
        let verdicts_total = IntCounterVec::new(
            Opts::new("k1s0_verdicts_total", "Authorization verdicts")
                .const_label("service", service_name),
            &["allow", "outcome"],
        )?;

        registry.register(Box::new(key_refresh_total.clone()))?;
        registry.register(Box::new(verification_failures_total.clone()))?;
        registry.register(Box::new(decision_cache_total.clone()))?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;
        registry.register(Box::new(circuit_open.clone()))?;
        registry.register(Box::new(verdicts_total.clone()))?;

        Ok(Self {
            key_refresh_total,
            verification_failures_total,
            decision_cache_total,
            circuit_transitions_total,
            circuit_open,
            verdicts_total,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// gather_text は Prometheus テキスト形式でメトリクスを返す。
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl EventSink for GatewayMetrics {
    fn emit(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::KeyRefresh {
                outcome, forced, ..
            } => {
                let forced = if *forced { "true" } else { "false" };
                self.key_refresh_total
                    .with_label_values(&[outcome.as_str(), forced])
                    .inc();
            }
            GatewayEvent::VerificationFailed { kind } => {
                self.verification_failures_total
                    .with_label_values(&[*kind])
                    .inc();
            }
            GatewayEvent::DecisionCache { outcome } => {
                self.decision_cache_total
                    .with_label_values(&[outcome.as_str()])
                    .inc();
            }
            GatewayEvent::CircuitTransition { name, from, to } => {
                self.circuit_transitions_total
                    .with_label_values(&[name.as_str(), *from, *to])
                    .inc();
                let open = i64::from(*to != "closed");
                self.circuit_open.with_label_values(&[name.as_str()]).set(open);
            }
            GatewayEvent::VerdictIssued { allow, outcome, .. } => {
                let allow = if *allow { "true" } else { "false" };
                self.verdicts_total
                    .with_label_values(&[allow, *outcome])
                    .inc();
            }
        }
    }
}
