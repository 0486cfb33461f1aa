#![cfg(test)]
#![allow(clippy::unwrap_used)]
//! Connector behaviour against an in-memory node

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connector_common::amount::sat_to_btc;
use connector_common::bitcoin::hashes::{sha256, Hash};
use connector_common::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use connector_common::{
    Direction, MemoryPaymentStore, MetricLabels, MetricsBackend, Payment, PaymentFilter,
    PaymentStore, Severity,
};
use futures::future;
use futures::stream::{self, StreamExt};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::node::NodeChain;
use crate::*;

const LOCAL_KEY: [u8; 32] = [0x11; 32];
const REMOTE_KEY: [u8; 32] = [0x33; 32];

fn pubkey(secret: [u8; 32]) -> String {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&secret).unwrap();
    PublicKey::from_secret_key(&secp, &key).to_string()
}

/// Simnet invoice signed by `secret`
fn invoice(secret: [u8; 32], amount_msat: Option<u64>, hash: u8) -> String {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&secret).unwrap();

    let builder = InvoiceBuilder::new(Currency::Simnet)
        .description("test".to_string())
        .payment_hash(sha256::Hash::from_slice(&[hash; 32]).unwrap())
        .payment_secret(PaymentSecret([7u8; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144);

    match amount_msat {
        Some(msat) => builder
            .amount_milli_satoshis(msat)
            .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key)),
        None => builder.build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key)),
    }
    .unwrap()
    .to_string()
}

fn settled(payment_request: &str, amount_sat: i64, hash: u8) -> SettlementEvent {
    SettlementEvent {
        settled: true,
        payment_request: payment_request.to_string(),
        amount_paid_sat: amount_sat,
        payment_hash: vec![hash; 32],
        receipt: b"alice".to_vec(),
        memo: "test".to_string(),
        value_sat: amount_sat,
    }
}

#[derive(Debug)]
enum Subscription {
    /// Subscribe call fails
    Fail,
    /// Yields the events, then stays open
    Feed(Vec<Result<SettlementEvent, Error>>),
    /// Yields the events, then ends
    Finite(Vec<Result<SettlementEvent, Error>>),
}

/// State shared by every client the fake connector hands out
#[derive(Debug, Default)]
struct Shared {
    info: Mutex<NodeInfo>,
    invoice: Mutex<String>,
    add_requests: Mutex<Vec<AddInvoiceRequest>>,
    subscriptions: Mutex<VecDeque<Subscription>>,
    subscribe_calls: AtomicUsize,
    send_requests: Mutex<Vec<SendRequest>>,
    send_response: Mutex<SendResponse>,
    route_requests: Mutex<Vec<RoutesRequest>>,
    routes: Mutex<Vec<Route>>,
    balance: Mutex<WalletBalance>,
    hang_balance: AtomicBool,
    closes: AtomicUsize,
    connects: Mutex<Vec<Instant>>,
    failing_connects: AtomicUsize,
    hang_connects: AtomicBool,
}

#[derive(Debug)]
struct FakeNode {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl FakeNode {
    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl LightningNode for FakeNode {
    async fn get_info(&self) -> Result<NodeInfo, Error> {
        self.check_open()?;
        Ok(self.shared.info.lock().clone())
    }

    async fn add_invoice(&self, request: AddInvoiceRequest) -> Result<String, Error> {
        self.check_open()?;
        self.shared.add_requests.lock().push(request);
        Ok(self.shared.invoice.lock().clone())
    }

    async fn subscribe_settlements(&self) -> Result<SettlementStream, Error> {
        self.check_open()?;
        self.shared.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let next = self.shared.subscriptions.lock().pop_front();
        match next {
            None => Ok(stream::pending().boxed()),
            Some(Subscription::Fail) => Err(Error::Rpc(tonic::Status::unavailable(
                "connection refused",
            ))),
            Some(Subscription::Feed(events)) => {
                Ok(stream::iter(events).chain(stream::pending()).boxed())
            }
            Some(Subscription::Finite(events)) => Ok(stream::iter(events).boxed()),
        }
    }

    async fn send_payment_sync(&self, request: SendRequest) -> Result<SendResponse, Error> {
        self.check_open()?;
        self.shared.send_requests.lock().push(request);
        Ok(self.shared.send_response.lock().clone())
    }

    async fn query_routes(&self, request: RoutesRequest) -> Result<Vec<Route>, Error> {
        self.check_open()?;
        self.shared.route_requests.lock().push(request);
        Ok(self.shared.routes.lock().clone())
    }

    async fn wallet_balance(&self) -> Result<WalletBalance, Error> {
        self.check_open()?;
        if self.shared.hang_balance.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        Ok(*self.shared.balance.lock())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct FakeConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl NodeConnector for FakeConnector {
    async fn connect(&self) -> Result<DynLightningNode, Error> {
        self.shared.connects.lock().push(Instant::now());
        if self.shared.hang_connects.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }

        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(Error::Connection("connection refused".to_string()));
        }

        Ok(Arc::new(FakeNode {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Ledger failing on demand
#[derive(Debug, Default)]
struct FailingStore {
    inner: MemoryPaymentStore,
    /// Next saves to fail, whatever the direction
    failing_saves: AtomicUsize,
    fail_outgoing: AtomicBool,
    fail_list: AtomicBool,
    hang_list: AtomicBool,
}

fn ledger_down() -> connector_common::Error {
    connector_common::Error::Store("ledger down".to_string())
}

#[async_trait]
impl PaymentStore for FailingStore {
    async fn save_payment(&self, payment: &Payment) -> Result<(), connector_common::Error> {
        let failing = self.failing_saves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_saves.store(failing - 1, Ordering::SeqCst);
            return Err(ledger_down());
        }

        if payment.direction == Direction::Outgoing && self.fail_outgoing.load(Ordering::SeqCst) {
            return Err(ledger_down());
        }

        self.inner.save_payment(payment).await
    }

    async fn list_payments(
        &self,
        filter: &PaymentFilter,
    ) -> Result<Vec<Payment>, connector_common::Error> {
        if self.hang_list.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }

        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ledger_down());
        }

        self.inner.list_payments(filter).await
    }
}

#[derive(Debug, Default)]
struct RecordingMetrics {
    errors: Mutex<Vec<(&'static str, Severity)>>,
    gauges: Mutex<HashMap<(&'static str, &'static str), f64>>,
}

impl RecordingMetrics {
    fn errors(&self, method: &str) -> Vec<Severity> {
        self.errors
            .lock()
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, severity)| *severity)
            .collect()
    }

    fn gauge(&self, method: &'static str, name: &'static str) -> Option<f64> {
        self.gauges.lock().get(&(method, name)).copied()
    }

    fn set(&self, labels: &MetricLabels, name: &'static str, value: f64) {
        self.gauges.lock().insert((labels.method, name), value);
    }
}

impl MetricsBackend for RecordingMetrics {
    fn add_error(&self, labels: &MetricLabels, severity: Severity) {
        self.errors.lock().push((labels.method, severity));
    }

    fn observe_call(&self, _labels: &MetricLabels, _elapsed: Duration) {}

    fn set_current_funds(&self, labels: &MetricLabels, funds: f64) {
        self.set(labels, "current_funds", funds);
    }

    fn set_overall_sent(&self, labels: &MetricLabels, sent: f64) {
        self.set(labels, "overall_sent", sent);
    }

    fn set_overall_received(&self, labels: &MetricLabels, received: f64) {
        self.set(labels, "overall_received", received);
    }

    fn set_overall_fee(&self, labels: &MetricLabels, fee: f64) {
        self.set(labels, "overall_fee", fee);
    }
}

struct Harness {
    connector: LndConnector,
    shared: Arc<Shared>,
    store: Arc<FailingStore>,
    metrics: Arc<RecordingMetrics>,
}

impl Harness {
    fn new() -> Self {
        let shared = Arc::new(Shared::default());
        *shared.info.lock() = NodeInfo {
            identity_pubkey: pubkey(LOCAL_KEY),
            alias: "local".to_string(),
            chains: vec![NodeChain {
                chain: "bitcoin".to_string(),
                network: "simnet".to_string(),
            }],
            ..Default::default()
        };

        let config = LndConfig {
            host: "localhost".to_string(),
            tls_cert_path: PathBuf::from("/tmp/tls.cert"),
            peer_host: "node.example.com".to_string(),
            ..Default::default()
        };

        let store = Arc::new(FailingStore::default());
        let metrics = Arc::new(RecordingMetrics::default());
        let connector = LndConnector::with_connector(
            config,
            Arc::new(FakeConnector {
                shared: shared.clone(),
            }),
            store.clone(),
            metrics.clone(),
        )
        .unwrap();

        Self {
            connector,
            shared,
            store,
            metrics,
        }
    }

    async fn started() -> Self {
        let harness = Self::new();
        harness.connector.start().await.unwrap();
        harness
    }

    async fn payments(&self) -> Vec<Payment> {
        self.store
            .inner
            .list_payments(&PaymentFilter::default())
            .await
            .unwrap()
    }

    fn connects(&self) -> Vec<Instant> {
        self.shared.connects.lock().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_network_mismatch() {
    let harness = Harness::new();
    harness.shared.info.lock().chains[0].network = "testnet".to_string();

    let err = harness.connector.start().await.unwrap_err();
    assert!(matches!(err, Error::NetworkMismatch { .. }));
    assert_eq!(harness.connector.lifecycle(), Lifecycle::Idle);
    assert_eq!(harness.shared.closes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.metrics.errors(METHOD_START), vec![Severity::High]);

    // Rolled back, a later start can succeed
    harness.shared.info.lock().chains[0].network = "simnet".to_string();
    harness.connector.start().await.unwrap();
    assert_eq!(harness.connector.lifecycle(), Lifecycle::Running);
    assert_eq!(harness.connector.identity(), Some(pubkey(LOCAL_KEY)));
}

#[tokio::test(start_paused = true)]
async fn test_start_legacy_node_network() {
    let harness = Harness::new();
    harness.shared.info.lock().chains.clear();

    // No chains and no testnet flag reads as simnet
    harness.connector.start().await.unwrap();
    assert_eq!(harness.connector.lifecycle(), Lifecycle::Running);
}

#[tokio::test(start_paused = true)]
async fn test_start_rolls_back_on_connection_failure() {
    let harness = Harness::new();
    harness.shared.failing_connects.store(1, Ordering::SeqCst);

    let err = harness.connector.start().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(harness.connector.lifecycle(), Lifecycle::Idle);

    harness.connector.start().await.unwrap();
    assert_eq!(harness.connects().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_noop() {
    let harness = Harness::started().await;

    harness.connector.start().await.unwrap();
    assert_eq!(harness.connects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start() {
    let harness = Harness::new();

    let err = harness.connector.stop("test").await.unwrap_err();
    assert!(matches!(err, Error::NotRunning));
    assert_eq!(harness.connector.lifecycle(), Lifecycle::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice() {
    let harness = Harness::started().await;

    harness.connector.stop("test").await.unwrap();
    harness.connector.stop("test").await.unwrap();

    assert_eq!(harness.connector.lifecycle(), Lifecycle::Stopped);
    assert_eq!(harness.shared.closes.load(Ordering::SeqCst), 1);
    assert!(harness.connector.tasks.is_empty());

    assert!(matches!(
        harness.connector.start().await,
        Err(Error::AlreadyStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_to_self_records_both_sides() {
    let harness = Harness::started().await;
    let mut received = harness.connector.received_payments();
    let invoice = invoice(LOCAL_KEY, Some(2_500_000), 0x21);

    let payment = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap();

    assert_eq!(payment.direction, Direction::Outgoing);
    assert_eq!(payment.amount, sat_to_btc(2_500));
    assert!(payment.media_fee.is_zero());
    assert!(harness.shared.send_requests.lock().is_empty());

    let payments = harness.payments().await;
    assert_eq!(payments.len(), 2);
    let incoming = payments
        .iter()
        .find(|p| p.direction == Direction::Incoming)
        .unwrap();
    assert_eq!(incoming.media_id, payment.media_id);
    assert_ne!(incoming.payment_id, payment.payment_id);
    assert_eq!(incoming.media_id, "21".repeat(32));

    assert_eq!(received.recv().await.unwrap(), *incoming);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_rejects_amount_mismatch() {
    let harness = Harness::started().await;
    let invoice = invoice(REMOTE_KEY, Some(2_500_000), 0x21);

    let err = harness
        .connector
        .send_to(&invoice, "0.00003")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::AmountMismatch {
            invoice: 2_500,
            expected: 3_000
        }
    ));
    assert!(harness.shared.send_requests.lock().is_empty());
    assert!(harness.payments().await.is_empty());
    assert_eq!(harness.metrics.errors(METHOD_SEND_TO), vec![Severity::Low]);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_rejects_zero_amount() {
    let harness = Harness::started().await;
    let invoice = invoice(REMOTE_KEY, None, 0x21);

    let err = harness.connector.send_to(&invoice, "").await.unwrap_err();

    assert!(matches!(err, Error::ZeroAmount));
    assert!(harness.shared.send_requests.lock().is_empty());
    assert_eq!(harness.metrics.errors(METHOD_SEND_TO), vec![Severity::High]);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_rejects_garbage_invoice() {
    let harness = Harness::started().await;

    let err = harness
        .connector
        .send_to("lnsb1garbage", "0.001")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Common(_)));
    assert_eq!(harness.metrics.errors(METHOD_SEND_TO), vec![Severity::Low]);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_remote_records_fee() {
    let harness = Harness::started().await;
    *harness.shared.send_response.lock() = SendResponse {
        total_fees_sat: 10,
        total_fees_msat: 10_000,
        ..Default::default()
    };
    let invoice = invoice(REMOTE_KEY, None, 0x21);

    let payment = harness
        .connector
        .send_to(&invoice, "0.001")
        .await
        .unwrap();

    assert_eq!(payment.direction, Direction::Outgoing);
    assert_eq!(payment.amount, sat_to_btc(100_000));
    assert_eq!(payment.media_fee, sat_to_btc(10));

    let requests = harness.shared.send_requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].amount_sat, Some(100_000));
    assert_eq!(requests[0].fee_limit_percent, FEE_LIMIT_PERCENT);

    let payments = harness.payments().await;
    assert_eq!(payments, vec![payment]);

    // (0 + 10) / 2
    assert_eq!(
        harness.connector.estimate_fee("").await.unwrap(),
        sat_to_btc(5)
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_to_invoice_amount_not_repeated() {
    let harness = Harness::started().await;
    let invoice = invoice(REMOTE_KEY, Some(2_500_000), 0x21);

    harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap();

    assert_eq!(harness.shared.send_requests.lock()[0].amount_sat, None);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_payment_error() {
    let harness = Harness::started().await;
    harness.shared.send_response.lock().payment_error = "no route".to_string();
    let invoice = invoice(REMOTE_KEY, Some(2_500_000), 0x21);

    let err = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PaymentFailed(ref reason) if reason == "no route"));
    assert!(harness.payments().await.is_empty());
    assert_eq!(harness.metrics.errors(METHOD_SEND_TO), vec![Severity::High]);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_after_stop() {
    let harness = Harness::started().await;
    harness.connector.stop("test").await.unwrap();
    let invoice = invoice(LOCAL_KEY, Some(2_500_000), 0x21);

    let err = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotRunning));
    assert!(harness.payments().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_settled_events_are_recorded() {
    let harness = Harness::new();
    let paid = invoice(REMOTE_KEY, Some(1_000_000), 0x41);
    let open = SettlementEvent {
        settled: false,
        ..settled(&invoice(REMOTE_KEY, Some(1_000_000), 0x42), 1_000, 0x42)
    };
    harness
        .shared
        .subscriptions
        .lock()
        .push_back(Subscription::Feed(vec![
            Ok(open),
            Ok(settled(&paid, 1_000, 0x41)),
        ]));

    let mut received = harness.connector.received_payments();
    harness.connector.start().await.unwrap();

    let payment = received.recv().await.unwrap();
    assert_eq!(payment.direction, Direction::Incoming);
    assert_eq!(payment.receipt, paid);
    assert_eq!(payment.account, "alice");
    assert_eq!(payment.amount, sat_to_btc(1_000));

    assert_eq!(harness.payments().await, vec![payment]);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failures_reconnect_with_backoff() {
    let harness = Harness::new();
    let paid = invoice(REMOTE_KEY, Some(1_000_000), 0x41);
    {
        let mut subscriptions = harness.shared.subscriptions.lock();
        subscriptions.push_back(Subscription::Fail);
        subscriptions.push_back(Subscription::Fail);
        subscriptions.push_back(Subscription::Fail);
        subscriptions.push_back(Subscription::Feed(vec![Ok(settled(&paid, 1_000, 0x41))]));
    }

    let mut received = harness.connector.received_payments();
    harness.connector.start().await.unwrap();

    let payment = received.recv().await.unwrap();
    assert_eq!(payment.receipt, paid);

    // Initial connection plus one per failure
    let connects = harness.connects();
    assert_eq!(connects.len(), 4);
    let initial_delay = ReconnectPolicy::default().initial_delay;
    for pair in connects.windows(2) {
        assert!(pair[1] - pair[0] >= initial_delay);
    }

    assert_eq!(harness.shared.subscribe_calls.load(Ordering::SeqCst), 4);
    assert_eq!(harness.shared.closes.load(Ordering::SeqCst), 3);
    assert_eq!(
        harness.metrics.errors(METHOD_HANDLE_PAYMENTS),
        vec![Severity::High; 3]
    );
    assert_eq!(harness.payments().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_resubscribes_without_reconnect() {
    let harness = Harness::new();
    let first = invoice(REMOTE_KEY, Some(1_000_000), 0x41);
    let second = invoice(REMOTE_KEY, Some(2_000_000), 0x42);
    {
        let mut subscriptions = harness.shared.subscriptions.lock();
        subscriptions.push_back(Subscription::Feed(vec![
            Ok(settled(&first, 1_000, 0x41)),
            Err(Error::Rpc(tonic::Status::unavailable("stream reset"))),
        ]));
        subscriptions.push_back(Subscription::Finite(vec![]));
        subscriptions.push_back(Subscription::Feed(vec![Ok(settled(&second, 2_000, 0x42))]));
    }

    let mut received = harness.connector.received_payments();
    let started = Instant::now();
    harness.connector.start().await.unwrap();

    assert_eq!(received.recv().await.unwrap().receipt, first);
    assert_eq!(received.recv().await.unwrap().receipt, second);

    assert_eq!(harness.connects().len(), 1);
    assert_eq!(harness.shared.subscribe_calls.load(Ordering::SeqCst), 3);
    assert!(Instant::now() - started < ReconnectPolicy::default().initial_delay);
    assert_eq!(harness.payments().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_backoff() {
    let harness = Harness::new();
    harness
        .shared
        .subscriptions
        .lock()
        .push_back(Subscription::Fail);

    harness.connector.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stopping = Instant::now();
    harness.connector.stop("test").await.unwrap();

    assert!(Instant::now() - stopping < Duration::from_secs(1));
    assert_eq!(harness.connects().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_estimate_fee() {
    let harness = Harness::started().await;
    *harness.shared.routes.lock() = vec![
        Route {
            total_fees_sat: 10,
            ..Default::default()
        },
        Route {
            total_fees_sat: 20,
            ..Default::default()
        },
    ];

    let with_amount = invoice(REMOTE_KEY, Some(2_500_000), 0x21);
    assert_eq!(
        harness.connector.estimate_fee(&with_amount).await.unwrap(),
        sat_to_btc(15)
    );

    let request = harness.shared.route_requests.lock()[0].clone();
    assert_eq!(request.pub_key, pubkey(REMOTE_KEY));
    assert_eq!(request.amount_sat, 2_500);
    assert_eq!(request.limit, FEE_ESTIMATE_ROUTES);
    assert_eq!(request.fee_limit_percent, Some(FEE_LIMIT_PERCENT));

    // Amountless invoices fall back to the running average
    let amountless = invoice(REMOTE_KEY, None, 0x22);
    assert!(harness
        .connector
        .estimate_fee(&amountless)
        .await
        .unwrap()
        .is_zero());
    assert_eq!(harness.shared.route_requests.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_estimate_fee_unchanged_by_queries() {
    let harness = Harness::started().await;
    *harness.shared.send_response.lock() = SendResponse {
        total_fees_sat: 8,
        ..Default::default()
    };
    harness
        .connector
        .send_to(&invoice(REMOTE_KEY, Some(1_000_000), 0x21), "0.00001")
        .await
        .unwrap();

    let average = harness.connector.estimate_fee("").await.unwrap();
    assert_eq!(average, sat_to_btc(4));

    harness.connector.info().await.unwrap();
    harness
        .connector
        .query_routes(&pubkey(REMOTE_KEY), "0.001", 5)
        .await
        .unwrap();
    harness
        .connector
        .validate_invoice(&invoice(REMOTE_KEY, None, 0x23), "")
        .await
        .unwrap();
    harness
        .connector
        .estimate_fee(&invoice(REMOTE_KEY, Some(1_000_000), 0x24))
        .await
        .unwrap();

    assert_eq!(harness.connector.estimate_fee("").await.unwrap(), average);
}

#[tokio::test(start_paused = true)]
async fn test_create_invoice() {
    let harness = Harness::started().await;
    let issued = invoice(LOCAL_KEY, Some(100_000_000), 0x51);
    *harness.shared.invoice.lock() = issued.clone();

    let (payment_request, decoded) = harness
        .connector
        .create_invoice("alice", "0.001", "coffee")
        .await
        .unwrap();

    assert_eq!(payment_request, issued);
    assert_eq!(decoded.amount_milli_satoshis(), Some(100_000_000));

    let request = harness.shared.add_requests.lock()[0].clone();
    assert_eq!(request.receipt, b"alice".to_vec());
    assert_eq!(request.amount_sat, 100_000);
    assert_eq!(request.memo, "coffee");
    assert_eq!(request.expiry_secs, 900);
}

#[tokio::test(start_paused = true)]
async fn test_validate_invoice() {
    let harness = Harness::started().await;
    let invoice = invoice(REMOTE_KEY, Some(2_500_000), 0x21);

    harness
        .connector
        .validate_invoice(&invoice, "0.000025")
        .await
        .unwrap();
    harness.connector.validate_invoice(&invoice, "").await.unwrap();

    assert!(matches!(
        harness.connector.validate_invoice(&invoice, "0.1").await,
        Err(Error::AmountMismatch { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_query_routes_rejects_bad_key() {
    let harness = Harness::started().await;

    let err = harness
        .connector
        .query_routes("02deadbeef", "0.001", 5)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Common(_)));
    assert!(harness.shared.route_requests.lock().is_empty());
    assert_eq!(harness.metrics.errors(METHOD_QUERY_ROUTES), vec![Severity::Low]);
}

#[tokio::test(start_paused = true)]
async fn test_info_and_balances() {
    let harness = Harness::started().await;
    *harness.shared.balance.lock() = WalletBalance {
        confirmed_sat: 150_000,
        unconfirmed_sat: 20_000,
    };

    let info = harness.connector.info().await.unwrap();
    assert_eq!(info.host, "node.example.com");
    assert_eq!(info.port, 9735);
    assert_eq!(info.min_amount, sat_to_btc(1));
    assert_eq!(info.max_amount.to_string(), "0.042");
    assert_eq!(info.node.identity_pubkey, pubkey(LOCAL_KEY));

    assert_eq!(
        harness.connector.confirmed_balance().await.unwrap(),
        sat_to_btc(150_000)
    );
    assert_eq!(
        harness.connector.pending_balance().await.unwrap(),
        sat_to_btc(20_000)
    );
}

#[tokio::test(start_paused = true)]
async fn test_pollers_report_gauges() {
    let harness = Harness::new();
    *harness.shared.balance.lock() = WalletBalance {
        confirmed_sat: 150_000,
        unconfirmed_sat: 0,
    };

    let received = Payment::completed(
        Direction::Incoming,
        "lnsb1a",
        "",
        "aa".repeat(32),
        sat_to_btc(100_000),
        Decimal::ZERO,
    );
    let sent = Payment::completed(
        Direction::Outgoing,
        "lnsb1b",
        "",
        "bb".repeat(32),
        sat_to_btc(50_000),
        sat_to_btc(1_000),
    );
    harness.store.save_payment(&received).await.unwrap();
    harness.store.save_payment(&sent).await.unwrap();

    harness.connector.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let close = |value: Option<f64>, expected: f64| (value.unwrap() - expected).abs() < 1e-12;
    assert!(close(
        harness.metrics.gauge(METHOD_BALANCE_POLLER, "current_funds"),
        0.0015
    ));
    assert!(close(
        harness.metrics.gauge(METHOD_REPORT_METRICS, "overall_received"),
        0.001
    ));
    assert!(close(
        harness.metrics.gauge(METHOD_REPORT_METRICS, "overall_sent"),
        0.0005
    ));
    assert!(close(
        harness.metrics.gauge(METHOD_REPORT_METRICS, "overall_fee"),
        0.00001
    ));

    // Balance changes are picked up on the next tick
    harness.shared.balance.lock().confirmed_sat = 200_000;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(close(
        harness.metrics.gauge(METHOD_BALANCE_POLLER, "current_funds"),
        0.002
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_balance_call_hanging() {
    let harness = Harness::new();
    harness.shared.hang_balance.store(true, Ordering::SeqCst);

    harness.connector.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    tokio::time::timeout(Duration::from_secs(3600), harness.connector.stop("test"))
        .await
        .unwrap()
        .unwrap();
    assert!(harness.connector.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_ledger_query_hanging() {
    let harness = Harness::new();
    harness.store.hang_list.store(true, Ordering::SeqCst);

    harness.connector.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    tokio::time::timeout(Duration::from_secs(3600), harness.connector.stop("test"))
        .await
        .unwrap()
        .unwrap();
    assert!(harness.connector.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_reconnect() {
    let harness = Harness::new();
    harness
        .shared
        .subscriptions
        .lock()
        .push_back(Subscription::Fail);

    harness.connector.start().await.unwrap();
    harness.shared.hang_connects.store(true, Ordering::SeqCst);

    // Past the first backoff, the reconnect is in flight
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.connects().len(), 2);

    tokio::time::timeout(Duration::from_secs(3600), harness.connector.stop("test"))
        .await
        .unwrap()
        .unwrap();
    assert!(harness.connector.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_settlement_loop_survives_ledger_failure() {
    let harness = Harness::new();
    let first = invoice(REMOTE_KEY, Some(1_000_000), 0x41);
    let second = invoice(REMOTE_KEY, Some(2_000_000), 0x42);
    harness
        .shared
        .subscriptions
        .lock()
        .push_back(Subscription::Feed(vec![
            Ok(settled(&first, 1_000, 0x41)),
            Ok(settled(&second, 2_000, 0x42)),
        ]));
    harness.store.failing_saves.store(1, Ordering::SeqCst);

    let mut received = harness.connector.received_payments();
    harness.connector.start().await.unwrap();

    assert_eq!(received.recv().await.unwrap().receipt, first);
    let payment = received.recv().await.unwrap();
    assert_eq!(payment.receipt, second);

    assert_eq!(harness.payments().await, vec![payment]);
    assert_eq!(harness.shared.subscribe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_remote_ledger_failure() {
    let harness = Harness::started().await;
    harness.store.fail_outgoing.store(true, Ordering::SeqCst);
    let invoice = invoice(REMOTE_KEY, Some(2_500_000), 0x21);

    let err = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Common(connector_common::Error::Store(_))
    ));
    assert_eq!(harness.shared.send_requests.lock().len(), 1);
    assert!(harness.payments().await.is_empty());
    assert_eq!(harness.metrics.errors(METHOD_SEND_TO), vec![Severity::High]);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_self_ledger_failure() {
    let harness = Harness::started().await;
    let mut received = harness.connector.received_payments();
    let invoice = invoice(LOCAL_KEY, Some(2_500_000), 0x21);

    // Incoming write fails, nothing is recorded or announced
    harness.store.failing_saves.store(1, Ordering::SeqCst);
    let err = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Common(connector_common::Error::Store(_))
    ));
    assert!(harness.payments().await.is_empty());
    assert!(received.try_recv().is_err());

    // Outgoing write fails, the incoming row stays
    harness.store.fail_outgoing.store(true, Ordering::SeqCst);
    let err = harness
        .connector
        .send_to(&invoice, "0.000025")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Common(connector_common::Error::Store(_))
    ));

    let payments = harness.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].direction, Direction::Incoming);
    assert_eq!(received.recv().await.unwrap(), payments[0]);

    assert!(harness.shared.send_requests.lock().is_empty());
    assert_eq!(
        harness.metrics.errors(METHOD_SEND_TO),
        vec![Severity::High; 2]
    );
}

#[tokio::test(start_paused = true)]
async fn test_report_skips_cycle_on_ledger_failure() {
    let harness = Harness::new();
    let received = Payment::completed(
        Direction::Incoming,
        "lnsb1a",
        "",
        "aa".repeat(32),
        sat_to_btc(100_000),
        Decimal::ZERO,
    );
    harness.store.inner.save_payment(&received).await.unwrap();
    harness.store.fail_list.store(true, Ordering::SeqCst);

    harness.connector.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    for gauge in ["overall_received", "overall_sent", "overall_fee"] {
        assert_eq!(harness.metrics.gauge(METHOD_REPORT_METRICS, gauge), None);
    }
    assert_eq!(
        harness.metrics.errors(METHOD_REPORT_METRICS),
        vec![Severity::High]
    );

    // Next cycle reports once the ledger is back
    harness.store.fail_list.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let overall = harness
        .metrics
        .gauge(METHOD_REPORT_METRICS, "overall_received")
        .unwrap();
    assert!((overall - 0.001).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_sub_satoshi_fee_not_averaged() {
    let harness = Harness::started().await;
    *harness.shared.send_response.lock() = SendResponse {
        total_fees_sat: 0,
        total_fees_msat: 400,
        ..Default::default()
    };

    let payment = harness
        .connector
        .send_to(&invoice(REMOTE_KEY, Some(1_000_000), 0x21), "0.00001")
        .await
        .unwrap();

    assert!(payment.media_fee.is_zero());
    assert!(harness.connector.estimate_fee("").await.unwrap().is_zero());
}
