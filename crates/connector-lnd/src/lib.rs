//! Lightning connector for LND

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use connector_common::amount::{btc_to_satoshi, sat_to_btc, MSAT_IN_SAT, SATOSHI_PER_BITCOIN};
use connector_common::invoice::{
    decode_invoice, invoice_amount_sat, parse_public_key, payee_pubkey_hex, payment_hash_hex,
};
use connector_common::{
    Asset, Bolt11Invoice, Decimal, Direction, DynMetricsBackend, DynPaymentStore, Metric,
    Network, Payment,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub mod client;
pub mod config;
pub mod error;
mod fee;
pub mod node;
mod pollers;
mod subscription;
#[cfg(test)]
mod tests;

pub use client::{GrpcConnector, LndClient};
pub use config::{LndConfig, ReconnectPolicy};
pub use error::Error;
use fee::AverageFee;
pub use node::{
    AddInvoiceRequest, DynLightningNode, DynNodeConnector, LightningNode, NodeConnector,
    NodeInfo, Route, RoutesRequest, SendRequest, SendResponse, SettlementEvent,
    SettlementStream, WalletBalance,
};
pub use pollers::{compute_totals, PaymentTotals};

/// Generated lnrpc types
#[allow(missing_docs, missing_debug_implementations, clippy::all)]
pub mod lnrpc {
    tonic::include_proto!("lnrpc");
}

/// Telemetry method name of [`LndConnector::create_invoice`]
pub const METHOD_CREATE_INVOICE: &str = "CreateInvoice";
/// Telemetry method name of [`LndConnector::send_to`]
pub const METHOD_SEND_TO: &str = "SendTo";
/// Telemetry method name of [`LndConnector::info`]
pub const METHOD_INFO: &str = "Info";
/// Telemetry method name of [`LndConnector::query_routes`]
pub const METHOD_QUERY_ROUTES: &str = "QueryRoutes";
/// Telemetry method name of [`LndConnector::start`]
pub const METHOD_START: &str = "Start";
/// Telemetry method name of the settlement loop
pub const METHOD_HANDLE_PAYMENTS: &str = "HandlePayments";
/// Telemetry method name of [`LndConnector::validate_invoice`]
pub const METHOD_VALIDATE_INVOICE: &str = "ValidateInvoice";
/// Telemetry method name of [`LndConnector::confirmed_balance`]
pub const METHOD_CONFIRMED_BALANCE: &str = "ConfirmedBalance";
/// Telemetry method name of [`LndConnector::pending_balance`]
pub const METHOD_PENDING_BALANCE: &str = "PendingBalance";
/// Telemetry method name of [`LndConnector::estimate_fee`]
pub const METHOD_ESTIMATE_FEE: &str = "EstimateFee";
/// Telemetry method name of the balance poller
pub const METHOD_BALANCE_POLLER: &str = "BalancePoller";
/// Telemetry method name of the aggregate reporter
pub const METHOD_REPORT_METRICS: &str = "ReportMetrics";

/// Lifetime of created invoices
pub const INVOICE_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Fee limit of outgoing payments and fee estimation, percent of the amount
pub const FEE_LIMIT_PERCENT: i64 = 3;

/// Routes requested for fee estimation
pub const FEE_ESTIMATE_ROUTES: i32 = 10;

const NOTIFICATION_CAPACITY: usize = 128;

/// Connector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, not started
    Idle,
    /// Pre-flight checks in progress
    Starting,
    /// Background tasks running
    Running,
    /// Stopped for good
    Stopped,
}

/// Node information returned by [`LndConnector::info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningInfo {
    /// Host advertised to peers
    pub host: String,
    /// Port advertised to peers
    pub port: u16,
    /// Smallest payable amount in bitcoin
    pub min_amount: Decimal,
    /// Largest payable amount in bitcoin
    pub max_amount: Decimal,
    /// Node information
    pub node: NodeInfo,
}

/// LND connector
#[derive(Debug, Clone)]
pub struct LndConnector {
    config: Arc<LndConfig>,
    network: Network,
    connector: DynNodeConnector,
    store: DynPaymentStore,
    metrics: DynMetricsBackend,
    node: Arc<RwLock<Option<DynLightningNode>>>,
    identity: Arc<RwLock<Option<String>>>,
    state: Arc<Mutex<Lifecycle>>,
    average_fee: Arc<AverageFee>,
    notifications: broadcast::Sender<Payment>,
    cancel_token: CancellationToken,
    tasks: TaskTracker,
}

impl LndConnector {
    /// Create new [`LndConnector`] talking gRPC to the configured node
    pub fn new(
        config: LndConfig,
        store: DynPaymentStore,
        metrics: DynMetricsBackend,
    ) -> Result<Self, Error> {
        let connector = GrpcConnector::new(
            config.address(),
            config.tls_cert_path.clone(),
            config.macaroon_path.clone(),
        );

        Self::with_connector(config, Arc::new(connector), store, metrics)
    }

    /// Create new [`LndConnector`] over a custom node factory
    pub fn with_connector(
        config: LndConfig,
        connector: DynNodeConnector,
        store: DynPaymentStore,
        metrics: DynMetricsBackend,
    ) -> Result<Self, Error> {
        let network = config.validate()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            network,
            connector,
            store,
            metrics,
            node: Arc::new(RwLock::new(None)),
            identity: Arc::new(RwLock::new(None)),
            state: Arc::new(Mutex::new(Lifecycle::Idle)),
            average_fee: Arc::new(AverageFee::default()),
            notifications,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Connect to the node, check it and launch the background tasks.
    ///
    /// Starting a started connector is a no-op. A failed start leaves the
    /// connector idle so it can be retried.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running => {
                    tracing::warn!("LND: connector already started");
                    return Ok(());
                }
                Lifecycle::Stopped => return Err(Error::AlreadyStopped),
            }
        }

        let metric = self.metric(METHOD_START);

        let (node, info) = match self.preflight().await {
            Ok(checked) => checked,
            Err(err) => {
                metric.add_error(err.severity());
                *self.state.lock() = Lifecycle::Idle;
                tracing::error!("LND: unable to start connector: {err}");
                return Err(err);
            }
        };

        *self.identity.write() = Some(info.identity_pubkey.clone());
        *self.node.write() = Some(node);

        self.tasks.spawn(subscription::run(self.clone()));
        self.tasks.spawn(pollers::balance(self.clone()));
        self.tasks.spawn(pollers::report(self.clone()));

        *self.state.lock() = Lifecycle::Running;

        tracing::info!(
            network = %self.network,
            identity = %info.identity_pubkey,
            alias = %info.alias,
            "LND: connector started"
        );
        Ok(())
    }

    /// Connect and check identity and network, before anything is spawned
    async fn preflight(&self) -> Result<(DynLightningNode, NodeInfo), Error> {
        let node = self.connector.connect().await?;

        let info = match node.get_info().await {
            Ok(info) => info,
            Err(err) => {
                node.close();
                return Err(err);
            }
        };

        if let Err(err) = self.check_network(&info) {
            node.close();
            return Err(err);
        }

        if info.identity_pubkey.is_empty() {
            node.close();
            return Err(Error::MissingField("identity_pubkey"));
        }

        Ok((node, info))
    }

    fn check_network(&self, info: &NodeInfo) -> Result<(), Error> {
        let node_network = match info.network() {
            Some(network) => network,
            // Legacy nodes only flag testnet; mainnet cannot be told apart
            None if self.network == Network::Mainnet => {
                tracing::info!("LND: node does not report its network, assuming mainnet");
                return Ok(());
            }
            None => Network::Simnet,
        };

        if node_network != self.network {
            return Err(Error::NetworkMismatch {
                configured: self.network.to_string(),
                node: node_network.to_string(),
            });
        }

        Ok(())
    }

    /// Stop the background tasks and close the transport.
    ///
    /// Waits for every background task to exit. Stopping twice is a no-op,
    /// stopping a connector that never started is an error.
    pub async fn stop(&self, reason: &str) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            match *state {
                Lifecycle::Running => *state = Lifecycle::Stopped,
                Lifecycle::Stopped => {
                    tracing::warn!("LND: connector already stopped");
                    return Ok(());
                }
                Lifecycle::Idle | Lifecycle::Starting => return Err(Error::NotRunning),
            }
        }

        self.cancel_token.cancel();
        if let Some(node) = self.node.write().take() {
            node.close();
        }

        self.tasks.close();
        self.tasks.wait().await;

        tracing::info!(reason, "LND: connector stopped");
        Ok(())
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        *self.state.lock()
    }

    /// Replace the node client with one over a fresh transport
    pub(crate) async fn reconnect(&self) -> Result<(), Error> {
        let node = self.connector.connect().await?;

        let mut current = self.node.write();
        if self.cancel_token.is_cancelled() {
            node.close();
            return Ok(());
        }

        if let Some(old) = current.replace(node) {
            old.close();
        }

        tracing::info!("LND: reconnected to node");
        Ok(())
    }

    pub(crate) fn node(&self) -> Result<DynLightningNode, Error> {
        self.node.read().clone().ok_or(Error::NotRunning)
    }

    pub(crate) fn metric(&self, method: &'static str) -> Metric {
        Metric::new(
            self.config.name.as_str(),
            Asset::Btc.to_string(),
            method,
            self.metrics.clone(),
        )
    }

    /// Run `operation` under a metric handle, tagging its error severity
    async fn instrumented<T>(
        &self,
        method: &'static str,
        operation: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let metric = self.metric(method);
        let result = operation.await;

        if let Err(err) = &result {
            metric.add_error(err.severity());
            tracing::warn!(method, "LND: {err}");
        }

        metric.finish();
        result
    }

    /// Publish an incoming payment to [`LndConnector::received_payments`] subscribers
    pub(crate) fn notify(&self, payment: &Payment) {
        // No receivers is fine
        let _ = self.notifications.send(payment.clone());
    }

    /// Create an invoice for `amount` bitcoin, `account` is carried as receipt
    pub async fn create_invoice(
        &self,
        account: &str,
        amount: &str,
        description: &str,
    ) -> Result<(String, Bolt11Invoice), Error> {
        self.instrumented(METHOD_CREATE_INVOICE, async {
            let amount_sat = btc_to_satoshi(amount)?;

            let payment_request = self
                .node()?
                .add_invoice(AddInvoiceRequest {
                    receipt: account.as_bytes().to_vec(),
                    amount_sat,
                    memo: description.to_string(),
                    expiry_secs: INVOICE_EXPIRY.as_secs() as i64,
                })
                .await?;

            let invoice = decode_invoice(&payment_request, self.network)?;
            Ok((payment_request, invoice))
        })
        .await
    }

    /// Pay `invoice`.
    ///
    /// `amount` is used for invoices without an embedded amount and must
    /// equal the embedded amount otherwise. Paying an invoice of the local
    /// node records the payment without a remote call.
    pub async fn send_to(&self, invoice: &str, amount: &str) -> Result<Payment, Error> {
        self.instrumented(METHOD_SEND_TO, self.pay(invoice, amount))
            .await
    }

    async fn pay(&self, invoice_str: &str, amount: &str) -> Result<Payment, Error> {
        let invoice = decode_invoice(invoice_str, self.network)?;
        let amount_sat = btc_to_satoshi(amount)?;

        let invoice_sat = invoice_amount_sat(&invoice);
        if let Some(invoice_sat) = invoice_sat {
            if invoice_sat != amount_sat {
                return Err(Error::AmountMismatch {
                    invoice: invoice_sat,
                    expected: amount_sat,
                });
            }
        }

        if amount_sat == 0 {
            return Err(Error::ZeroAmount);
        }

        if self.lifecycle() != Lifecycle::Running {
            return Err(Error::NotRunning);
        }
        let identity = self.identity().ok_or(Error::NotRunning)?;
        let payment_hash = payment_hash_hex(&invoice);
        let amount_btc = sat_to_btc(amount_sat);

        let media_fee = if payee_pubkey_hex(&invoice) == identity {
            // lnd refuses to pay itself
            let incoming = Payment::completed(
                Direction::Incoming,
                invoice_str,
                "",
                payment_hash.as_str(),
                amount_btc,
                Decimal::ZERO,
            );
            self.store.save_payment(&incoming).await?;
            self.notify(&incoming);

            tracing::info!(
                payment_id = %incoming.payment_id,
                payment_hash = %payment_hash,
                "LND: self payment recorded"
            );
            Decimal::ZERO
        } else {
            let response = self
                .node()?
                .send_payment_sync(SendRequest {
                    payment_request: invoice_str.to_string(),
                    amount_sat: invoice_sat.is_none().then_some(amount_sat),
                    fee_limit_percent: FEE_LIMIT_PERCENT,
                })
                .await?;

            if !response.payment_error.is_empty() {
                return Err(Error::PaymentFailed(response.payment_error));
            }

            // The ledger holds whole satoshis, the average follows it
            let fee_sat = response.total_fees_sat.max(0);
            self.average_fee
                .record_msat((fee_sat as u64).saturating_mul(MSAT_IN_SAT));

            sat_to_btc(fee_sat)
        };

        let outgoing = Payment::completed(
            Direction::Outgoing,
            invoice_str,
            "",
            payment_hash,
            amount_btc,
            media_fee,
        );
        self.store.save_payment(&outgoing).await?;

        tracing::info!(
            payment_id = %outgoing.payment_id,
            amount = %outgoing.amount,
            fee = %outgoing.media_fee,
            "LND: payment sent"
        );
        Ok(outgoing)
    }

    /// Node information and payable amount limits
    pub async fn info(&self) -> Result<LightningInfo, Error> {
        self.instrumented(METHOD_INFO, async {
            let node = self.node()?.get_info().await?;

            Ok(LightningInfo {
                host: self.config.peer_host.clone(),
                port: self.config.peer_port,
                min_amount: Decimal::new(1, 8),
                max_amount: Decimal::new(42, 3),
                node,
            })
        })
        .await
    }

    /// Up to `limit` routes able to carry `amount` bitcoin to `pub_key`
    pub async fn query_routes(
        &self,
        pub_key: &str,
        amount: &str,
        limit: i32,
    ) -> Result<Vec<Route>, Error> {
        self.instrumented(METHOD_QUERY_ROUTES, async {
            let amount_sat = btc_to_satoshi(amount)?;
            parse_public_key(pub_key)?;

            self.node()?
                .query_routes(RoutesRequest {
                    pub_key: pub_key.trim().to_string(),
                    amount_sat,
                    limit,
                    fee_limit_percent: None,
                })
                .await
        })
        .await
    }

    /// Decode `invoice` for the configured network.
    ///
    /// A non-zero `amount` must match the amount embedded in the invoice, if
    /// there is one.
    pub async fn validate_invoice(
        &self,
        invoice: &str,
        amount: &str,
    ) -> Result<Bolt11Invoice, Error> {
        self.instrumented(METHOD_VALIDATE_INVOICE, async {
            let amount_sat = btc_to_satoshi(amount)?;
            let invoice = decode_invoice(invoice, self.network)?;

            if amount_sat != 0 {
                if let Some(invoice_sat) = invoice_amount_sat(&invoice) {
                    if invoice_sat != amount_sat {
                        return Err(Error::AmountMismatch {
                            invoice: invoice_sat,
                            expected: amount_sat,
                        });
                    }
                }
            }

            Ok(invoice)
        })
        .await
    }

    /// Confirmed on-chain funds in bitcoin
    pub async fn confirmed_balance(&self) -> Result<Decimal, Error> {
        self.instrumented(METHOD_CONFIRMED_BALANCE, async {
            let balance = self.node()?.wallet_balance().await?;
            Ok(sat_to_btc(balance.confirmed_sat))
        })
        .await
    }

    /// Unconfirmed on-chain funds in bitcoin
    pub async fn pending_balance(&self) -> Result<Decimal, Error> {
        self.instrumented(METHOD_PENDING_BALANCE, async {
            let balance = self.node()?.wallet_balance().await?;
            Ok(sat_to_btc(balance.unconfirmed_sat))
        })
        .await
    }

    /// Expected routing fee in bitcoin for paying `invoice`.
    ///
    /// Without an invoice, or for an invoice without amount, the running
    /// average fee of past payments is returned.
    pub async fn estimate_fee(&self, invoice: &str) -> Result<Decimal, Error> {
        self.instrumented(METHOD_ESTIMATE_FEE, async {
            if invoice.trim().is_empty() {
                return Ok(self.average_fee.btc());
            }

            let invoice = decode_invoice(invoice, self.network)?;
            let Some(amount_sat) = invoice_amount_sat(&invoice) else {
                return Ok(self.average_fee.btc());
            };

            let routes = self
                .node()?
                .query_routes(RoutesRequest {
                    pub_key: payee_pubkey_hex(&invoice),
                    amount_sat,
                    limit: FEE_ESTIMATE_ROUTES,
                    fee_limit_percent: Some(FEE_LIMIT_PERCENT),
                })
                .await?;

            if routes.is_empty() {
                tracing::debug!("LND: no routes found, using average fee");
                return Ok(self.average_fee.btc());
            }

            let total: i64 = routes.iter().map(|route| route.total_fees_sat).sum();
            let average = Decimal::from(total) / Decimal::from(routes.len() as u64);

            Ok((average / Decimal::from(SATOSHI_PER_BITCOIN)).round_dp(8))
        })
        .await
    }

    /// Feed of incoming payments observed by the connector
    pub fn received_payments(&self) -> broadcast::Receiver<Payment> {
        self.notifications.subscribe()
    }

    /// Identity public key of the node, known once started
    pub fn identity(&self) -> Option<String> {
        self.identity.read().clone()
    }

    /// Configured network
    pub fn network(&self) -> Network {
        self.network
    }
}
