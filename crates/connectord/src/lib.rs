//! Lightning connector daemon

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use connector_common::{DynMetricsBackend, MemoryPaymentStore, NoopMetrics, Payment};
use connector_lnd::LndConnector;
use connector_prometheus::{PrometheusMetrics, PrometheusServer};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod cli;
pub mod config;

use crate::cli::CLIArgs;
use crate::config::{LoggingConfig, Settings};

const DEFAULT_WORK_DIR: &str = ".connectord";
const CONFIG_FILE_NAME: &str = "config.toml";
const LOG_FILE_PREFIX: &str = "connectord.log";

/// Noisy dependencies capped below the configured level
const QUIET_TARGETS: &[&str] = &[
    "h2=warn",
    "hyper=warn",
    "hyper_util=warn",
    "tower=warn",
    "rustls=warn",
];

fn expand_path(path: &Path) -> Option<PathBuf> {
    match path.strip_prefix("~") {
        Ok(remainder) => home::home_dir().map(|home| home.join(remainder)),
        Err(_) => Some(path.to_path_buf()),
    }
}

/// Resolve and create the working directory
pub async fn get_work_directory(args: &CLIArgs) -> Result<PathBuf> {
    let work_dir = match &args.work_dir {
        Some(dir) => dir.clone(),
        None => home::home_dir()
            .ok_or(anyhow!("Unknown home dir"))?
            .join(DEFAULT_WORK_DIR),
    };

    tokio::fs::create_dir_all(&work_dir).await?;

    Ok(work_dir)
}

/// Load the settings from `config_file`, or `config.toml` in the work dir
/// when it exists
pub fn load_settings(work_dir: &Path, config_file: Option<&Path>) -> Result<Settings> {
    let default_file = work_dir.join(CONFIG_FILE_NAME);
    let config_file = match config_file {
        Some(path) => Some(path),
        None if default_file.exists() => Some(default_file.as_path()),
        None => None,
    };

    let mut settings = Settings::new(config_file)?;
    settings.expand_paths();
    settings.lnd.validate()?;

    Ok(settings)
}

/// Install the global subscriber.
///
/// The returned guard flushes the log file and must be held until exit.
pub fn setup_tracing(work_dir: &Path, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let directives = std::iter::once(logging.level.as_str())
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let console_layer = fmt::layer().with_target(true);

    if !logging.file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;
        return Ok(None);
    }

    let log_dir = logging.dir.clone().unwrap_or_else(|| work_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!("Writing logs to {}", log_dir.display());

    Ok(Some(guard))
}

/// Run the connector until ctrl-c
pub async fn run_connectord(settings: Settings) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut server = None;

    let metrics: DynMetricsBackend = if settings.prometheus.enabled {
        let metrics = PrometheusMetrics::new()?;
        let listener =
            PrometheusServer::bind((&settings.prometheus).into(), metrics.registry()).await?;
        server = Some(tokio::spawn(listener.serve(shutdown.clone())));
        Arc::new(metrics)
    } else {
        tracing::info!("Prometheus disabled");
        Arc::new(NoopMetrics)
    };

    let store = Arc::new(MemoryPaymentStore::new());
    let connector = LndConnector::new(settings.lnd, store, metrics)?;

    let result = serve(&connector).await;

    shutdown.cancel();
    if let Some(server) = server {
        if let Err(err) = server.await {
            tracing::error!("Prometheus server task failed: {err}");
        }
    }

    result
}

/// Start `connector` with its payment feed already followed, so payments
/// settled while it starts are not missed
async fn start_following(connector: &LndConnector) -> Result<broadcast::Receiver<Payment>> {
    let payments = connector.received_payments();

    connector.start().await?;
    tracing::info!(
        identity = %connector.identity().unwrap_or_default(),
        network = %connector.network(),
        "Connector started"
    );

    Ok(payments)
}

async fn serve(connector: &LndConnector) -> Result<()> {
    let mut payments = start_following(connector).await?;

    let log_payments = async {
        loop {
            match payments.recv().await {
                Ok(payment) => tracing::info!(
                    payment_id = %payment.payment_id,
                    account = %payment.account,
                    amount = %payment.amount,
                    "Payment received"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {skipped} payment notifications")
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = log_payments => {}
    }

    tracing::info!("Shutdown signal received");
    connector.stop("interrupted").await?;

    Ok(())
}
