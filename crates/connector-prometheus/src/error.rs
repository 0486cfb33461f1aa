use thiserror::Error;

/// Errors that can occur in the Prometheus crate
#[derive(Error, Debug)]
pub enum PrometheusError {
    /// Server binding error
    #[error("Failed to bind to address {address}: {source}")]
    ServerBind {
        /// Address the server tried to bind
        address: String,
        /// Underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Registry error
    #[error("Registry error: {source}")]
    Registry {
        /// Underlying prometheus error
        #[from]
        source: prometheus::Error,
    },
}

/// Result type for Prometheus operations
pub type Result<T> = std::result::Result<T, PrometheusError>;
