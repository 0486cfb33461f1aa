//! # Connector Prometheus
//!
//! Prometheus telemetry backend for the lightning connectors and an HTTP
//! endpoint exposing the collected series.

#![doc = include_str!("../README.md")]

pub mod error;
pub mod metrics;
pub mod server;

pub use error::{PrometheusError, Result};
pub use metrics::PrometheusMetrics;
pub use server::{PrometheusConfig, PrometheusServer};

// Re-export prometheus crate for custom metrics
pub use prometheus;
