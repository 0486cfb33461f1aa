//! Payment ledger interface

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::payment::{Asset, Media, Payment, PaymentStatus};
use crate::Error;

/// Filter for [`PaymentStore::list_payments`]. `None` fields match any value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    /// Asset
    pub asset: Option<Asset>,
    /// Status
    pub status: Option<PaymentStatus>,
    /// Counterparty account
    pub account: Option<String>,
    /// Media
    pub media: Option<Media>,
}

impl PaymentFilter {
    /// Whether `payment` passes the filter
    pub fn matches(&self, payment: &Payment) -> bool {
        self.asset.is_none_or(|asset| asset == payment.asset)
            && self.status.is_none_or(|status| status == payment.status)
            && self
                .account
                .as_deref()
                .is_none_or(|account| account == payment.account)
            && self.media.is_none_or(|media| media == payment.media)
    }
}

/// External payment ledger.
///
/// `save_payment` is expected to be idempotent on `payment_id`: connectors
/// deliver at least once and rely on the ledger to suppress duplicates. The
/// ledger must also tolerate concurrent writes for different ids.
#[async_trait]
pub trait PaymentStore: Debug + Send + Sync {
    /// Insert or replace a payment
    async fn save_payment(&self, payment: &Payment) -> Result<(), Error>;

    /// List payments matching the filter
    async fn list_payments(&self, filter: &PaymentFilter) -> Result<Vec<Payment>, Error>;
}

/// Shared payment ledger handle
pub type DynPaymentStore = Arc<dyn PaymentStore>;

/// In-memory ledger
#[derive(Debug, Default)]
pub struct MemoryPaymentStore {
    payments: RwLock<HashMap<String, Payment>>,
}

impl MemoryPaymentStore {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payments
    pub async fn len(&self) -> usize {
        self.payments.read().await.len()
    }

    /// Whether the ledger is empty
    pub async fn is_empty(&self) -> bool {
        self.payments.read().await.is_empty()
    }

    /// Look up a payment by id
    pub async fn get(&self, payment_id: &str) -> Option<Payment> {
        self.payments.read().await.get(payment_id).cloned()
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn save_payment(&self, payment: &Payment) -> Result<(), Error> {
        if payment.payment_id.is_empty() {
            return Err(Error::Store("payment id is empty".to_string()));
        }

        let mut payments = self.payments.write().await;
        payments.insert(payment.payment_id.clone(), payment.clone());
        tracing::trace!(payment_id = %payment.payment_id, "Stored payment");
        Ok(())
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> Result<Vec<Payment>, Error> {
        let payments = self.payments.read().await;
        let mut matching: Vec<Payment> = payments
            .values()
            .filter(|payment| filter.matches(payment))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.payment_id.cmp(&b.payment_id))
        });
        Ok(matching)
    }
}
