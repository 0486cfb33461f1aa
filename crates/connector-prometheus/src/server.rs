use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use prometheus::{Registry, TextEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::PrometheusError;

/// Configuration for the Prometheus server
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Address to bind the server to (default: "127.0.0.1:9090")
    pub bind_address: SocketAddr,
    /// Path to serve metrics on (default: "/metrics")
    pub metrics_path: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

/// Prometheus metrics server
#[derive(Debug)]
pub struct PrometheusServer {
    config: PrometheusConfig,
    registry: Arc<Registry>,
    listener: TcpListener,
}

impl PrometheusServer {
    /// Bind the server to the configured address
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound
    pub async fn bind(config: PrometheusConfig, registry: Arc<Registry>) -> crate::Result<Self> {
        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(|source| PrometheusError::ServerBind {
                address: config.bind_address.to_string(),
                source,
            })?;

        Ok(Self {
            config,
            registry,
            listener,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serve metrics until `cancel_token` fires
    pub async fn serve(self, cancel_token: CancellationToken) {
        tracing::info!(
            "Started Prometheus server on {} at path {}",
            self.local_addr().unwrap_or(self.config.bind_address),
            self.config.metrics_path
        );

        loop {
            let accepted = tokio::select! {
                _ = cancel_token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&self.registry);
                    let path = self.config.metrics_path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &registry, &path).await {
                            tracing::warn!("Failed to serve metrics request: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {e}");
                }
            }
        }

        tracing::info!("Prometheus server stopped");
    }
}

/// Gather and encode every series of the registry
pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&registry.gather())
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {e}");
            format!("Failed to encode metrics: {e}")
        })
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: &Registry,
    path: &str,
) -> std::io::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;
    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let response = if request.starts_with(&format!("GET {path} HTTP")) {
        let metrics = render(registry);
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
            metrics.len(),
            metrics
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 9\r\n\r\nNot Found"
            .to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
