//! Settlement subscription loop

use connector_common::bitcoin::hex::DisplayHex;
use connector_common::{amount::sat_to_btc, Decimal, Direction, Payment, Severity};
use futures::StreamExt;

use crate::node::{SettlementEvent, SettlementStream};
use crate::{Error, LndConnector, METHOD_HANDLE_PAYMENTS};

/// Follow the invoice feed of the node until the connector is stopped.
///
/// A failed subscribe backs off, then replaces the whole transport before the
/// next attempt. A broken stream is resubscribed right away.
pub(crate) async fn run(connector: LndConnector) {
    let metric = connector.metric(METHOD_HANDLE_PAYMENTS);
    let cancel_token = connector.cancel_token.clone();
    let policy = connector.config.reconnect.clone();

    let mut stream: Option<SettlementStream> = None;
    let mut failures: u32 = 0;

    loop {
        let Some(updates) = stream.as_mut() else {
            tracing::info!("LND: subscribing to invoice updates");

            let subscribed = tokio::select! {
                _ = cancel_token.cancelled() => break,
                subscribed = subscribe(&connector) => subscribed,
            };

            match subscribed {
                Ok(updates) => {
                    failures = 0;
                    stream = Some(updates);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    metric.add_error(Severity::High);

                    let delay = policy.delay(failures);
                    tracing::error!(
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "LND: unable to subscribe to invoice updates: {err}"
                    );

                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    // Subscribe failures are mostly a dead connection
                    let reconnected = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        reconnected = connector.reconnect() => reconnected,
                    };
                    if let Err(err) = reconnected {
                        metric.add_error(Severity::High);
                        tracing::error!("LND: unable to reconnect: {err}");
                    }
                }
            }
            continue;
        };

        let update = tokio::select! {
            _ = cancel_token.cancelled() => break,
            update = updates.next() => update,
        };

        match update {
            Some(Ok(event)) => tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = handle_event(&connector, event) => {}
            },
            Some(Err(err)) => {
                metric.add_error(Severity::High);
                tracing::error!("LND: unable to read from invoice stream: {err}");
                stream = None;
            }
            None => {
                tracing::warn!("LND: invoice stream ended");
                stream = None;
            }
        }
    }

    tracing::info!("LND: invoice subscription stopped");
}

async fn subscribe(connector: &LndConnector) -> Result<SettlementStream, Error> {
    connector.node()?.subscribe_settlements().await
}

async fn handle_event(connector: &LndConnector, event: SettlementEvent) {
    if !event.settled {
        tracing::info!(
            payment_request = %event.payment_request,
            amount = event.value_sat,
            receipt = %String::from_utf8_lossy(&event.receipt),
            memo = %event.memo,
            "LND: received invoice creation notification"
        );
        return;
    }

    let Some(payment) = incoming_payment(&event) else {
        tracing::warn!(
            payment_request = %event.payment_request,
            "LND: settled invoice without payment request or hash, skipping"
        );
        return;
    };

    if let Err(err) = connector.store.save_payment(&payment).await {
        tracing::error!(
            payment_id = %payment.payment_id,
            "LND: unable to save payment: {err}"
        );
    }

    tracing::info!(
        payment_id = %payment.payment_id,
        payment_hash = %payment.media_id,
        amount = %payment.amount,
        account = %payment.account,
        "LND: received payment"
    );
    connector.notify(&payment);
}

/// Completed incoming payment for a settled invoice
pub(crate) fn incoming_payment(event: &SettlementEvent) -> Option<Payment> {
    if event.payment_request.is_empty() || event.payment_hash.is_empty() {
        return None;
    }

    let account = match String::from_utf8_lossy(&event.receipt) {
        receipt if receipt.is_empty() => event.memo.clone(),
        receipt => receipt.into_owned(),
    };

    Some(Payment::completed(
        Direction::Incoming,
        &event.payment_request,
        account,
        event.payment_hash.to_lower_hex_string(),
        sat_to_btc(event.amount_paid_sat),
        Decimal::ZERO,
    ))
}
