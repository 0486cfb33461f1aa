use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use connector_lnd::LndConfig;
use connector_prometheus::PrometheusConfig;
use serde::{Deserialize, Serialize};

/// Prefix of the environment overrides, e.g. `CONNECTORD__LND__HOST`
pub const ENV_PREFIX: &str = "CONNECTORD";

/// Metrics endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prometheus {
    /// Serve metrics, telemetry is dropped otherwise
    pub enabled: bool,
    /// Address the endpoint listens on
    pub bind_address: SocketAddr,
    /// HTTP path of the endpoint
    pub metrics_path: String,
}

impl Default for Prometheus {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

impl From<&Prometheus> for PrometheusConfig {
    fn from(settings: &Prometheus) -> Self {
        Self {
            bind_address: settings.bind_address,
            metrics_path: settings.metrics_path.clone(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, `RUST_LOG` takes precedence
    pub level: String,
    /// Also write logs to daily rotated files
    pub file: bool,
    /// Log directory, `<work dir>/logs` when unset
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            dir: None,
        }
    }
}

/// Daemon settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `[lnd]` connector settings
    pub lnd: LndConfig,
    /// `[prometheus]` endpoint settings
    pub prometheus: Prometheus,
    /// `[logging]` settings
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from defaults, `config_file` and the environment
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&Self::default())?))
    }

    /// Expand `~` in the lnd credential paths
    pub fn expand_paths(&mut self) {
        if let Some(path) = crate::expand_path(&self.lnd.tls_cert_path) {
            self.lnd.tls_cert_path = path;
        }

        if let Some(path) = self.lnd.macaroon_path.as_deref().and_then(crate::expand_path) {
            self.lnd.macaroon_path = Some(path);
        }

        if let Some(path) = self.logging.dir.as_deref().and_then(crate::expand_path) {
            self.logging.dir = Some(path);
        }
    }
}
