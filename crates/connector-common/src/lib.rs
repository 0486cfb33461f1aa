//! Common types and traits for lightning connectors

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod amount;
pub mod error;
pub mod invoice;
pub mod metrics;
pub mod payment;
pub mod store;

pub use bitcoin;
pub use error::Error;
pub use lightning_invoice::Bolt11Invoice;
pub use rust_decimal::Decimal;

pub use self::invoice::Network;
pub use self::metrics::{
    DynMetricsBackend, Metric, MetricLabels, MetricsBackend, NoopMetrics, Severity,
};
pub use self::payment::{Asset, Direction, Media, Payment, PaymentStatus};
pub use self::store::{DynPaymentStore, MemoryPaymentStore, PaymentFilter, PaymentStore};
