//! Prometheus metrics for the routing core

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use anyhow::Result;

/// Prometheus metrics collector shared by dispatch and reconciliation
#[derive(Clone)]
pub struct MetricsCollector {
    /// Resolve calls by service and outcome
    pub resolve_total: IntCounterVec,
    /// Time callers spent waiting for admission, by route
    pub admission_wait_seconds: HistogramVec,
    /// Known instances per service after the last change
    pub registry_instances: IntGaugeVec,
    /// Reconciliation passes by mode and outcome
    pub reconcile_passes_total: IntCounterVec,
    /// Current reconciliation mode (0 = discovery backed, 1 = self checked)
    pub reconcile_mode: IntGauge,
    /// Mode switches made by the supervisor
    pub mode_transitions_total: IntCounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let resolve_total = IntCounterVec::new(
            Opts::new("gateway_resolve_total", "Backend resolutions by outcome"),
            &["service", "outcome"],
        )?;

        let admission_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_admission_wait_seconds",
                "Time spent waiting for route admission",
            ),
            &["route"],
        )?;

        let registry_instances = IntGaugeVec::new(
            Opts::new("gateway_registry_instances", "Registered instances per service"),
            &["service"],
        )?;

        let reconcile_passes_total = IntCounterVec::new(
            Opts::new("gateway_reconcile_passes_total", "Reconciliation passes by mode and outcome"),
            &["mode", "outcome"],
        )?;

        let reconcile_mode = IntGauge::new(
            "gateway_reconcile_mode",
            "Reconciliation mode (0 = discovery backed, 1 = self checked)",
        )?;

        let mode_transitions_total = IntCounterVec::new(
            Opts::new("gateway_mode_transitions_total", "Reconciliation mode transitions"),
            &["from", "to"],
        )?;

        registry.register(Box::new(resolve_total.clone()))?;
        registry.register(Box::new(admission_wait_seconds.clone()))?;
        registry.register(Box::new(registry_instances.clone()))?;
        registry.register(Box::new(reconcile_passes_total.clone()))?;
        registry.register(Box::new(reconcile_mode.clone()))?;
        registry.register(Box::new(mode_transitions_total.clone()))?;

        Ok(Self {
            resolve_total,
            admission_wait_seconds,
            registry_instances,
            reconcile_passes_total,
            reconcile_mode,
            mode_transitions_total,
            registry,
        })
    }

    pub fn record_resolve(&self, service: &str, ok: bool) {
        let outcome = if ok { "selected" } else { "no_backend" };
        self.resolve_total.with_label_values(&[service, outcome]).inc();
    }

    pub fn record_admission_wait(&self, route: &str, seconds: f64) {
        self.admission_wait_seconds
            .with_label_values(&[route])
            .observe(seconds);
    }

    pub fn set_instances(&self, service: &str, count: usize) {
        self.registry_instances
            .with_label_values(&[service])
            .set(count as i64);
    }

    pub fn record_pass(&self, mode: &str, outcome: &str) {
        self.reconcile_passes_total
            .with_label_values(&[mode, outcome])
            .inc();
    }

    pub fn record_transition(&self, from: &str, to: &str, mode_value: i64) {
        self.mode_transitions_total.with_label_values(&[from, to]).inc();
        self.reconcile_mode.set(mode_value);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        assert!(collector.gather().is_ok());
    }

    #[test]
    fn test_metrics_collector_clone_shares_registry() {
        let collector1 = MetricsCollector::new().expect("Failed to create collector");
        let collector2 = collector1.clone();

        collector2.record_resolve("users", true);
        let metrics = collector1.gather().expect("Failed to gather metrics");
        assert!(metrics.contains("gateway_resolve_total{outcome=\"selected\",service=\"users\"} 1"));
    }

    #[test]
    fn test_metrics_text_format_structure() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        collector.record_resolve("users", false);
        collector.record_admission_wait("api", 0.25);
        collector.set_instances("users", 3);
        collector.record_pass("discovery_backed", "success");
        collector.record_transition("discovery_backed", "self_checked", 1);

        let metrics = collector.gather().expect("Failed to gather metrics");

        assert!(metrics.contains("# HELP"));
        assert!(metrics.contains("# TYPE"));
        assert!(metrics.contains("gateway_admission_wait_seconds"));
        assert!(metrics.contains("gateway_registry_instances{service=\"users\"} 3"));
        assert!(metrics.contains("gateway_reconcile_mode 1"));
        assert!(metrics.contains("gateway_mode_transitions_total"));
    }
}
