//! Payment records written to the ledger

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::{sha256, Hash};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Payment direction relative to the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Funds received by the local node
    Incoming,
    /// Funds sent by the local node
    Outgoing,
    /// Both parties are the local node
    Internal,
}

impl Direction {
    /// Tag used when deriving payment ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Payment is in flight
    Pending,
    /// Payment reached finality
    Completed,
    /// Payment failed
    Failed,
}

/// Asset a payment is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Bitcoin
    #[serde(rename = "BTC")]
    Btc,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Btc => write!(f, "BTC"),
        }
    }
}

/// Medium a payment travelled through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Media {
    /// Lightning network
    Lightning,
    /// On-chain transaction
    Blockchain,
}

/// Normalized payment record.
///
/// A self-payment (destination is the local node) is recorded as two rows: one
/// [`Direction::Incoming`] and one [`Direction::Outgoing`], sharing `media_id`
/// but with distinct `payment_id`s, exactly as a payment between two separate
/// parties would be. Consumers summing volumes should pair them by `media_id`
/// if they want the net movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Deterministic id, see [`generate_payment_id`]
    pub payment_id: String,
    /// Observation time in milliseconds since the Unix epoch
    pub updated_at: u64,
    /// Payment state
    pub status: PaymentStatus,
    /// Payment direction
    pub direction: Direction,
    /// Free-form counterparty reference carried from the invoice
    pub account: String,
    /// Encoded payment request the payment settled
    pub receipt: String,
    /// Asset
    pub asset: Asset,
    /// Media
    pub media: Media,
    /// Hex encoded payment hash
    pub media_id: String,
    /// Amount in bitcoin
    pub amount: Decimal,
    /// Routing fee paid, in bitcoin
    pub media_fee: Decimal,
}

impl Payment {
    /// Completed lightning payment in bitcoin observed now
    pub fn completed(
        direction: Direction,
        receipt: &str,
        account: impl Into<String>,
        media_id: impl Into<String>,
        amount: Decimal,
        media_fee: Decimal,
    ) -> Self {
        Self {
            payment_id: generate_payment_id(receipt, direction),
            updated_at: now_in_millis(),
            status: PaymentStatus::Completed,
            direction,
            account: account.into(),
            receipt: receipt.to_string(),
            asset: Asset::Btc,
            media: Media::Lightning,
            media_id: media_id.into(),
            amount,
            media_fee,
        }
    }
}

/// Derive the payment id from the payment request and direction.
///
/// The same settlement observed twice in the same direction always maps to the
/// same id, which is what makes ledger writes idempotent.
pub fn generate_payment_id(receipt: &str, direction: Direction) -> String {
    let mut preimage = Vec::with_capacity(receipt.len() + direction.as_str().len());
    preimage.extend_from_slice(receipt.as_bytes());
    preimage.extend_from_slice(direction.as_str().as_bytes());

    sha256::Hash::hash(&preimage).to_string()
}

/// Milliseconds since the Unix epoch
pub fn now_in_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
