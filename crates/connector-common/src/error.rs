//! Errors

use thiserror::Error;

/// Connector common error
#[derive(Debug, Error)]
pub enum Error {
    /// Amount string is not a decimal number
    #[error("Invalid amount `{0}`")]
    InvalidAmount(String),
    /// Amount is negative
    #[error("Amount `{0}` is negative")]
    NegativeAmount(String),
    /// Amount has more precision than one satoshi
    #[error("Amount `{0}` is more precise than one satoshi")]
    SubSatoshiPrecision(String),
    /// Amount does not fit into satoshis
    #[error("Amount overflow")]
    AmountOverflow,
    /// Unknown network name
    #[error("Unknown network `{0}`")]
    UnknownNetwork(String),
    /// Invoice was issued for another network
    #[error("Invoice is for `{invoice}` network, expected `{expected}`")]
    InvoiceNetworkMismatch {
        /// Network reported by the invoice
        invoice: String,
        /// Network the connector works with
        expected: String,
    },
    /// Invoice failed to decode
    #[error(transparent)]
    Invoice(#[from] lightning_invoice::ParseOrSemanticError),
    /// Public key failed to parse
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] bitcoin::secp256k1::Error),
    /// Payment ledger error
    #[error("Payment store error: {0}")]
    Store(String),
}
