//! Running average routing fee

use std::sync::atomic::{AtomicU64, Ordering};

use connector_common::amount::msat_to_btc;
use connector_common::Decimal;

/// Average fee of outgoing payments, weighted toward the most recent one.
///
/// Stored as millisatoshis so concurrent sends can update it with a
/// compare-and-swap loop.
#[derive(Debug, Default)]
pub struct AverageFee {
    msat: AtomicU64,
}

impl AverageFee {
    /// Fold the fee of the latest payment in: `(old + latest) / 2`
    pub fn record_msat(&self, latest_msat: u64) {
        let _ = self
            .msat
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some(old / 2 + latest_msat / 2 + (old % 2 + latest_msat % 2) / 2)
            });
    }

    /// Current average in millisatoshis
    pub fn msat(&self) -> u64 {
        self.msat.load(Ordering::Acquire)
    }

    /// Current average in bitcoin, rounded to the satoshi
    pub fn btc(&self) -> Decimal {
        msat_to_btc(self.msat())
    }
}
