//! LND Errors

use connector_common::Severity;
use thiserror::Error;

/// LND Error
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is incomplete or inconsistent
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Connector was not started
    #[error("LND connector is not running")]
    NotRunning,
    /// Connector was stopped and cannot be started again
    #[error("LND connector already stopped")]
    AlreadyStopped,
    /// Certificate or macaroon could not be read
    #[error("Failed to read file `{path}`: {source}")]
    ReadFile {
        /// File path
        path: String,
        /// Underlying io error
        #[source]
        source: std::io::Error,
    },
    /// Transport could not be established
    #[error("LND connection error: {0}")]
    Connection(String),
    /// Transport was closed by `stop`
    #[error("LND transport closed")]
    TransportClosed,
    /// Node returned an rpc error
    #[error("LND rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    /// Route lookup failed
    #[error("LND route query failed: {0}")]
    RouteQuery(tonic::Status),
    /// Node runs on another network
    #[error("LND network mismatch, configured `{configured}`, node is on `{node}`")]
    NetworkMismatch {
        /// Configured network
        configured: String,
        /// Network the node reported
        node: String,
    },
    /// Requested amount differs from the invoice amount
    #[error("Amount mismatch, invoice has {invoice} sat, requested {expected} sat")]
    AmountMismatch {
        /// Amount embedded in the invoice
        invoice: i64,
        /// Amount supplied by the caller
        expected: i64,
    },
    /// Neither the invoice nor the caller specify an amount
    #[error("Payment amount is zero")]
    ZeroAmount,
    /// Node reported a payment failure
    #[error("LND payment failed: {0}")]
    PaymentFailed(String),
    /// Node response is missing a field
    #[error("LND response is missing `{0}`")]
    MissingField(&'static str),
    /// Common error
    #[error(transparent)]
    Common(#[from] connector_common::Error),
}

impl Error {
    /// Telemetry severity of the error.
    ///
    /// Caller mistakes are low, anything pointing at the node, the transport
    /// or the ledger is high.
    pub fn severity(&self) -> Severity {
        match self {
            Self::AmountMismatch { .. } | Self::RouteQuery(_) | Self::NotRunning => Severity::Low,
            Self::Common(err) => match err {
                connector_common::Error::Store(_) | connector_common::Error::UnknownNetwork(_) => {
                    Severity::High
                }
                _ => Severity::Low,
            },
            Self::InvalidConfig(_)
            | Self::AlreadyStopped
            | Self::ReadFile { .. }
            | Self::Connection(_)
            | Self::TransportClosed
            | Self::Rpc(_)
            | Self::NetworkMismatch { .. }
            | Self::ZeroAmount
            | Self::PaymentFailed(_)
            | Self::MissingField(_) => Severity::High,
        }
    }
}
