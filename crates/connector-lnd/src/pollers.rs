//! Balance poller and aggregate reporter

use connector_common::{
    Asset, Decimal, Direction, Media, Metric, Payment, PaymentFilter, PaymentStatus, Severity,
};
use rust_decimal::prelude::ToPrimitive;

use crate::{Error, LndConnector, METHOD_BALANCE_POLLER, METHOD_REPORT_METRICS};

/// Report the confirmed balance as the current funds gauge
pub(crate) async fn balance(connector: LndConnector) {
    let metric = connector.metric(METHOD_BALANCE_POLLER);
    let interval = connector.config.balance_interval;

    loop {
        let balance = tokio::select! {
            _ = connector.cancel_token.cancelled() => break,
            balance = connector.confirmed_balance() => balance,
        };

        match balance {
            Ok(balance) => {
                tracing::debug!(asset = "BTC", media = "lightning", funds = %balance, "LND: available funds");
                metric.current_funds(balance.to_f64().unwrap_or_default());
            }
            Err(err) => {
                metric.add_error(Severity::Middle);
                tracing::error!("LND: unable to get available funds: {err}");
            }
        }

        tokio::select! {
            _ = connector.cancel_token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!("LND: balance poller stopped");
}

/// Report overall volumes from the ledger
pub(crate) async fn report(connector: LndConnector) {
    let metric = connector.metric(METHOD_REPORT_METRICS);
    let interval = connector.config.report_interval;

    loop {
        let reported = tokio::select! {
            _ = connector.cancel_token.cancelled() => break,
            reported = report_totals(&connector, &metric) => reported,
        };

        if let Err(err) = reported {
            metric.add_error(err.severity());
            tracing::error!("LND: unable to report metrics: {err}");
        }

        tokio::select! {
            _ = connector.cancel_token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!("LND: aggregate reporter stopped");
}

async fn report_totals(connector: &LndConnector, metric: &Metric) -> Result<(), Error> {
    let filter = PaymentFilter {
        asset: Some(Asset::Btc),
        status: Some(PaymentStatus::Completed),
        account: None,
        media: Some(Media::Lightning),
    };
    let payments = connector.store.list_payments(&filter).await?;

    let totals = compute_totals(&payments);
    metric.overall_received(totals.received.to_f64().unwrap_or_default());
    metric.overall_sent(totals.sent.to_f64().unwrap_or_default());
    metric.overall_fee(totals.fee.to_f64().unwrap_or_default());

    tracing::info!(
        received = %totals.received,
        sent = %totals.sent,
        fee = %totals.fee,
        "LND: metrics reported"
    );
    Ok(())
}

/// Overall volumes over a set of payments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentTotals {
    /// Sum of incoming amounts
    pub received: Decimal,
    /// Sum of outgoing amounts
    pub sent: Decimal,
    /// Sum of fees of outgoing and internal payments
    pub fee: Decimal,
}

/// Sum payments by direction
pub fn compute_totals(payments: &[Payment]) -> PaymentTotals {
    payments
        .iter()
        .fold(PaymentTotals::default(), |mut totals, payment| {
            match payment.direction {
                Direction::Incoming => totals.received += payment.amount,
                Direction::Outgoing => {
                    totals.sent += payment.amount;
                    totals.fee += payment.media_fee;
                }
                Direction::Internal => totals.fee += payment.media_fee,
            }
            totals
        })
}
