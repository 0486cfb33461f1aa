//! Satoshi and bitcoin amount conversions
//!
//! Amounts cross the connector boundary as decimal bitcoin strings and travel to
//! the node as integer satoshis. Ledger records carry [`Decimal`] bitcoin values
//! with eight decimal places.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::Error;

/// Number of satoshis in one bitcoin
pub const SATOSHI_PER_BITCOIN: i64 = 100_000_000;

/// Number of millisatoshis in one satoshi
pub const MSAT_IN_SAT: u64 = 1_000;

/// Decimal places of the bitcoin display unit
pub const BTC_DECIMAL_PLACES: u32 = 8;

/// Convert a decimal bitcoin string into satoshis.
///
/// An empty string is read as zero so that callers can leave the amount out
/// when an invoice already carries one.
pub fn btc_to_satoshi(amount: &str) -> Result<i64, Error> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Ok(0);
    }

    let btc = Decimal::from_str(amount).map_err(|_| Error::InvalidAmount(amount.to_string()))?;
    if btc.is_sign_negative() && !btc.is_zero() {
        return Err(Error::NegativeAmount(amount.to_string()));
    }

    let satoshis = btc
        .checked_mul(Decimal::from(SATOSHI_PER_BITCOIN))
        .ok_or(Error::AmountOverflow)?;
    if !satoshis.fract().is_zero() {
        return Err(Error::SubSatoshiPrecision(amount.to_string()));
    }

    satoshis.to_i64().ok_or(Error::AmountOverflow)
}

/// Convert satoshis into a bitcoin amount with eight decimal places
pub fn sat_to_btc(satoshis: i64) -> Decimal {
    Decimal::new(satoshis, BTC_DECIMAL_PLACES)
}

/// Convert millisatoshis into a bitcoin amount rounded to the satoshi
pub fn msat_to_btc(msat: u64) -> Decimal {
    let msat = Decimal::from(msat);
    (msat / Decimal::from(MSAT_IN_SAT) / Decimal::from(SATOSHI_PER_BITCOIN))
        .round_dp(BTC_DECIMAL_PLACES)
}
