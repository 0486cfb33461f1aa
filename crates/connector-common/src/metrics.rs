//! Telemetry sink interface
//!
//! Every logical connector operation opens a [`Metric`] handle, tags errors on
//! it with a [`Severity`] and finishes it when the operation returns.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How bad an error is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    /// Caller supplied bad input
    Low,
    /// Degraded but self healing
    Middle,
    /// Node, transport or ledger failure
    High,
}

impl Severity {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Middle => "middle",
            Self::High => "high",
        }
    }
}

/// Labels identifying one logical operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricLabels {
    /// Daemon name, e.g. `lnd`
    pub daemon: String,
    /// Asset, e.g. `BTC`
    pub asset: String,
    /// Operation name
    pub method: &'static str,
}

/// Telemetry backend
pub trait MetricsBackend: Debug + Send + Sync {
    /// Count an error of the given severity
    fn add_error(&self, labels: &MetricLabels, severity: Severity);

    /// Record a finished call
    fn observe_call(&self, labels: &MetricLabels, elapsed: Duration);

    /// Funds available on the node
    fn set_current_funds(&self, labels: &MetricLabels, funds: f64);

    /// Total amount sent
    fn set_overall_sent(&self, labels: &MetricLabels, sent: f64);

    /// Total amount received
    fn set_overall_received(&self, labels: &MetricLabels, received: f64);

    /// Total routing fee paid
    fn set_overall_fee(&self, labels: &MetricLabels, fee: f64);
}

/// Shared telemetry backend handle
pub type DynMetricsBackend = Arc<dyn MetricsBackend>;

/// Backend that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsBackend for NoopMetrics {
    fn add_error(&self, _labels: &MetricLabels, _severity: Severity) {}
    fn observe_call(&self, _labels: &MetricLabels, _elapsed: Duration) {}
    fn set_current_funds(&self, _labels: &MetricLabels, _funds: f64) {}
    fn set_overall_sent(&self, _labels: &MetricLabels, _sent: f64) {}
    fn set_overall_received(&self, _labels: &MetricLabels, _received: f64) {}
    fn set_overall_fee(&self, _labels: &MetricLabels, _fee: f64) {}
}

/// Per-operation metric handle.
///
/// The call duration is recorded once, on [`Metric::finish`] or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct Metric {
    labels: MetricLabels,
    backend: DynMetricsBackend,
    started: Instant,
}

impl Metric {
    /// Open a handle for `method`
    pub fn new(
        daemon: impl Into<String>,
        asset: impl Into<String>,
        method: &'static str,
        backend: DynMetricsBackend,
    ) -> Self {
        Self {
            labels: MetricLabels {
                daemon: daemon.into(),
                asset: asset.into(),
                method,
            },
            backend,
            started: Instant::now(),
        }
    }

    /// Labels of this handle
    pub fn labels(&self) -> &MetricLabels {
        &self.labels
    }

    /// Count an error
    pub fn add_error(&self, severity: Severity) {
        self.backend.add_error(&self.labels, severity);
    }

    /// Report available funds
    pub fn current_funds(&self, funds: f64) {
        self.backend.set_current_funds(&self.labels, funds);
    }

    /// Report total amount sent
    pub fn overall_sent(&self, sent: f64) {
        self.backend.set_overall_sent(&self.labels, sent);
    }

    /// Report total amount received
    pub fn overall_received(&self, received: f64) {
        self.backend.set_overall_received(&self.labels, received);
    }

    /// Report total fee paid
    pub fn overall_fee(&self, fee: f64) {
        self.backend.set_overall_fee(&self.labels, fee);
    }

    /// Finish the operation
    pub fn finish(self) {}
}

impl Drop for Metric {
    fn drop(&mut self) {
        self.backend
            .observe_call(&self.labels, self.started.elapsed());
    }
}
