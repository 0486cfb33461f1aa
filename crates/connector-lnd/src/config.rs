//! Connector configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use connector_common::Network;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Reconnection backoff of the settlement loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay after the first failure
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Delay ceiling
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: u32,
    /// Fraction of the delay randomised in both directions, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Delay without jitter after `failures` consecutive failures
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);

        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Jittered delay after `failures` consecutive failures.
    ///
    /// Never shorter than `initial_delay` nor longer than `max_delay`.
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let factor = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor)
            .clamp(self.initial_delay, self.max_delay.max(self.initial_delay))
    }
}

/// lnd connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LndConfig {
    /// Daemon name used in telemetry labels
    pub name: String,
    /// lnd gRPC host
    pub host: String,
    /// lnd gRPC port
    pub port: u16,
    /// lnd TLS certificate
    pub tls_cert_path: PathBuf,
    /// lnd macaroon, unauthenticated when missing
    pub macaroon_path: Option<PathBuf>,
    /// Network the node is expected to run on
    pub network: String,
    /// Host advertised to peers
    pub peer_host: String,
    /// Port advertised to peers
    pub peer_port: u16,
    /// Balance poller period
    #[serde(with = "secs")]
    pub balance_interval: Duration,
    /// Aggregate reporter period
    #[serde(with = "secs")]
    pub report_interval: Duration,
    /// Settlement loop reconnection backoff
    pub reconnect: ReconnectPolicy,
}

impl Default for LndConfig {
    fn default() -> Self {
        Self {
            name: "lnd".to_string(),
            host: String::new(),
            port: 10009,
            tls_cert_path: PathBuf::new(),
            macaroon_path: None,
            network: Network::Simnet.to_string(),
            peer_host: String::new(),
            peer_port: 9735,
            balance_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LndConfig {
    /// gRPC address of the node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the configuration and resolve the network
    pub fn validate(&self) -> Result<Network, Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name should be specified".to_string()));
        }

        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host should be specified".to_string()));
        }

        if self.port == 0 {
            return Err(Error::InvalidConfig("port should be specified".to_string()));
        }

        if self.tls_cert_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "tls cert path should be specified".to_string(),
            ));
        }

        if self.peer_host.is_empty() {
            return Err(Error::InvalidConfig(
                "peer host should be specified".to_string(),
            ));
        }

        if self.peer_port == 0 {
            return Err(Error::InvalidConfig(
                "peer port should be specified".to_string(),
            ));
        }

        if self.balance_interval.is_zero() || self.report_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll intervals should be positive".to_string(),
            ));
        }

        if self.reconnect.initial_delay.is_zero()
            || self.reconnect.max_delay < self.reconnect.initial_delay
        {
            return Err(Error::InvalidConfig(
                "reconnect delays should be positive and ordered".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(Error::InvalidConfig(
                "reconnect jitter should be within 0..=1".to_string(),
            ));
        }

        Ok(Network::from_str(&self.network)?)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
