//! BOLT11 invoice and node identity helpers

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use lightning_invoice::{Bolt11Invoice, Currency};
use serde::{Deserialize, Serialize};

use crate::amount::MSAT_IN_SAT;
use crate::Error;

/// Blockchain network a connector operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet
    Mainnet,
    /// Bitcoin testnet
    Testnet,
    /// btcd simulation network
    Simnet,
    /// Bitcoin regtest
    Regtest,
    /// Bitcoin signet
    Signet,
}

impl Network {
    /// Invoice currency the network issues invoices in
    pub fn currency(&self) -> Currency {
        match self {
            Self::Mainnet => Currency::Bitcoin,
            Self::Testnet => Currency::BitcoinTestnet,
            Self::Simnet => Currency::Simnet,
            Self::Regtest => Currency::Regtest,
            Self::Signet => Currency::Signet,
        }
    }

    /// Network name as used in configuration and by the node
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Simnet => "simnet",
            Self::Regtest => "regtest",
            Self::Signet => "signet",
        }
    }

    fn from_currency(currency: Currency) -> Self {
        match currency {
            Currency::Bitcoin => Self::Mainnet,
            Currency::BitcoinTestnet => Self::Testnet,
            Currency::Simnet => Self::Simnet,
            Currency::Regtest => Self::Regtest,
            Currency::Signet => Self::Signet,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Self::Mainnet),
            "testnet" | "testnet3" => Ok(Self::Testnet),
            "simnet" => Ok(Self::Simnet),
            "regtest" => Ok(Self::Regtest),
            "signet" => Ok(Self::Signet),
            other => Err(Error::UnknownNetwork(other.to_string())),
        }
    }
}

/// Decode an encoded invoice and check it was issued for `network`
pub fn decode_invoice(invoice: &str, network: Network) -> Result<Bolt11Invoice, Error> {
    let decoded = Bolt11Invoice::from_str(invoice.trim())?;

    let invoice_network = Network::from_currency(decoded.currency());
    if invoice_network != network {
        return Err(Error::InvoiceNetworkMismatch {
            invoice: invoice_network.to_string(),
            expected: network.to_string(),
        });
    }

    Ok(decoded)
}

/// Amount embedded in the invoice, in whole satoshis
pub fn invoice_amount_sat(invoice: &Bolt11Invoice) -> Option<i64> {
    invoice
        .amount_milli_satoshis()
        .map(|msat| (msat / MSAT_IN_SAT) as i64)
}

/// Hex encoded payment hash of the invoice
pub fn payment_hash_hex(invoice: &Bolt11Invoice) -> String {
    invoice.payment_hash().to_string()
}

/// Hex encoded compressed public key of the invoice destination
pub fn payee_pubkey_hex(invoice: &Bolt11Invoice) -> String {
    invoice.get_payee_pub_key().to_string()
}

/// Parse a hex encoded node public key
pub fn parse_public_key(pub_key: &str) -> Result<PublicKey, Error> {
    Ok(PublicKey::from_str(pub_key.trim())?)
}
