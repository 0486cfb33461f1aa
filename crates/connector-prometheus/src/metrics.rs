use std::sync::Arc;
use std::time::Duration;

use connector_common::{MetricLabels, MetricsBackend, Severity};
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

const CALL_LABELS: &[&str] = &["daemon", "asset", "method"];
const ERROR_LABELS: &[&str] = &["daemon", "asset", "method", "severity"];
const FUNDS_LABELS: &[&str] = &["daemon", "asset"];

/// Connector telemetry exported to Prometheus
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,

    // Call metrics
    calls_total: IntCounterVec,
    errors_total: IntCounterVec,
    call_duration: HistogramVec,

    // Funds metrics
    current_funds: GaugeVec,
    overall_received: GaugeVec,
    overall_sent: GaugeVec,
    overall_fee: GaugeVec,
}

impl PrometheusMetrics {
    /// Create the metrics in a fresh registry
    pub fn new() -> crate::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create the metrics in `registry`
    pub fn with_registry(registry: Arc<Registry>) -> crate::Result<Self> {
        let calls_total = IntCounterVec::new(
            Opts::new("connector_calls_total", "Total number of connector calls"),
            CALL_LABELS,
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("connector_errors_total", "Total number of connector errors"),
            ERROR_LABELS,
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let call_duration = HistogramVec::new(
            HistogramOpts::new(
                "connector_call_duration_seconds",
                "Connector call duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            CALL_LABELS,
        )?;
        registry.register(Box::new(call_duration.clone()))?;

        let current_funds = GaugeVec::new(
            Opts::new("connector_current_funds", "Funds available on the node"),
            FUNDS_LABELS,
        )?;
        registry.register(Box::new(current_funds.clone()))?;

        let overall_received = GaugeVec::new(
            Opts::new("connector_overall_received", "Overall amount received"),
            FUNDS_LABELS,
        )?;
        registry.register(Box::new(overall_received.clone()))?;

        let overall_sent = GaugeVec::new(
            Opts::new("connector_overall_sent", "Overall amount sent"),
            FUNDS_LABELS,
        )?;
        registry.register(Box::new(overall_sent.clone()))?;

        let overall_fee = GaugeVec::new(
            Opts::new("connector_overall_fee", "Overall routing fee paid"),
            FUNDS_LABELS,
        )?;
        registry.register(Box::new(overall_fee.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            errors_total,
            call_duration,
            current_funds,
            overall_received,
            overall_sent,
            overall_fee,
        })
    }

    /// Get the metrics registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

impl MetricsBackend for PrometheusMetrics {
    fn add_error(&self, labels: &MetricLabels, severity: Severity) {
        self.errors_total
            .with_label_values(&[
                labels.daemon.as_str(),
                labels.asset.as_str(),
                labels.method,
                severity.as_str(),
            ])
            .inc();
    }

    fn observe_call(&self, labels: &MetricLabels, elapsed: Duration) {
        let values = [labels.daemon.as_str(), labels.asset.as_str(), labels.method];
        self.calls_total.with_label_values(&values).inc();
        self.call_duration
            .with_label_values(&values)
            .observe(elapsed.as_secs_f64());
    }

    fn set_current_funds(&self, labels: &MetricLabels, funds: f64) {
        self.current_funds
            .with_label_values(&[labels.daemon.as_str(), labels.asset.as_str()])
            .set(funds);
    }

    fn set_overall_sent(&self, labels: &MetricLabels, sent: f64) {
        self.overall_sent
            .with_label_values(&[labels.daemon.as_str(), labels.asset.as_str()])
            .set(sent);
    }

    fn set_overall_received(&self, labels: &MetricLabels, received: f64) {
        self.overall_received
            .with_label_values(&[labels.daemon.as_str(), labels.asset.as_str()])
            .set(received);
    }

    fn set_overall_fee(&self, labels: &MetricLabels, fee: f64) {
        self.overall_fee
            .with_label_values(&[labels.daemon.as_str(), labels.asset.as_str()])
            .set(fee);
    }
}
