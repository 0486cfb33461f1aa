//! Remote node seam
//!
//! [`LightningNode`] is the view of lnd the connector works against. The
//! gRPC client in [`crate::client`] implements it for a real node and tests
//! implement it in memory.

use std::fmt::Debug;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use connector_common::Network;
use futures::Stream;

use crate::Error;

/// Stream of invoice updates pushed by the node
pub type SettlementStream = Pin<Box<dyn Stream<Item = Result<SettlementEvent, Error>> + Send>>;

/// Shared node handle
pub type DynLightningNode = Arc<dyn LightningNode>;

/// Remote lightning node
#[async_trait]
pub trait LightningNode: Debug + Send + Sync {
    /// Node identity and chain
    async fn get_info(&self) -> Result<NodeInfo, Error>;

    /// Create an invoice, returns the encoded payment request
    async fn add_invoice(&self, request: AddInvoiceRequest) -> Result<String, Error>;

    /// Open the invoice update feed
    async fn subscribe_settlements(&self) -> Result<SettlementStream, Error>;

    /// Pay an invoice and wait for the outcome
    async fn send_payment_sync(&self, request: SendRequest) -> Result<SendResponse, Error>;

    /// Find candidate routes to a node
    async fn query_routes(&self, request: RoutesRequest) -> Result<Vec<Route>, Error>;

    /// On-chain wallet balance
    async fn wallet_balance(&self) -> Result<WalletBalance, Error>;

    /// Drop the transport. Calls made afterwards fail.
    fn close(&self);
}

/// Factory of node clients, called at start and on every reconnection
#[async_trait]
pub trait NodeConnector: Debug + Send + Sync {
    /// Build a client over a fresh transport
    async fn connect(&self) -> Result<DynLightningNode, Error>;
}

/// Shared node factory
pub type DynNodeConnector = Arc<dyn NodeConnector>;

/// Node chain as reported by `GetInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeChain {
    /// Chain name, e.g. `bitcoin`
    pub chain: String,
    /// Network name, e.g. `mainnet`
    pub network: String,
}

/// Node information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Hex encoded identity public key
    pub identity_pubkey: String,
    /// Node alias
    pub alias: String,
    /// Number of active channels
    pub num_active_channels: u32,
    /// Number of connected peers
    pub num_peers: u32,
    /// Best block height
    pub block_height: u32,
    /// Best block hash
    pub block_hash: String,
    /// Whether the node is synced to chain
    pub synced_to_chain: bool,
    /// Legacy testnet flag
    pub testnet: bool,
    /// Advertised node uris
    pub uris: Vec<String>,
    /// lnd version
    pub version: String,
    /// Active chains
    pub chains: Vec<NodeChain>,
}

impl NodeInfo {
    /// Network the node reports, if it reports one.
    ///
    /// Newer nodes list their chains; older ones only carry the testnet flag,
    /// which cannot distinguish mainnet from simnet, so `None` is returned
    /// for a node with no chains and the flag unset.
    pub fn network(&self) -> Option<Network> {
        if let Some(chain) = self.chains.first() {
            return Network::from_str(&chain.network).ok();
        }

        self.testnet.then_some(Network::Testnet)
    }
}

/// `AddInvoice` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddInvoiceRequest {
    /// Counterparty reference stored in the invoice receipt
    pub receipt: Vec<u8>,
    /// Amount in satoshis
    pub amount_sat: i64,
    /// Invoice description
    pub memo: String,
    /// Expiry in seconds
    pub expiry_secs: i64,
}

/// Invoice update pushed by the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementEvent {
    /// Whether the invoice was paid
    pub settled: bool,
    /// Encoded payment request
    pub payment_request: String,
    /// Amount paid in satoshis
    pub amount_paid_sat: i64,
    /// Payment hash
    pub payment_hash: Vec<u8>,
    /// Receipt set at invoice creation
    pub receipt: Vec<u8>,
    /// Invoice description
    pub memo: String,
    /// Requested amount in satoshis
    pub value_sat: i64,
}

/// `SendPaymentSync` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    /// Encoded payment request
    pub payment_request: String,
    /// Amount for invoices that carry none
    pub amount_sat: Option<i64>,
    /// Fee limit as percent of the amount
    pub fee_limit_percent: i64,
}

/// `SendPaymentSync` outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResponse {
    /// Non-empty when the node failed to deliver the payment
    pub payment_error: String,
    /// Payment preimage
    pub payment_preimage: Vec<u8>,
    /// Payment hash
    pub payment_hash: Vec<u8>,
    /// Routing fee in satoshis
    pub total_fees_sat: i64,
    /// Routing fee in millisatoshis
    pub total_fees_msat: i64,
}

/// `QueryRoutes` parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutesRequest {
    /// Hex encoded destination public key
    pub pub_key: String,
    /// Amount in satoshis
    pub amount_sat: i64,
    /// Maximum number of routes
    pub limit: i32,
    /// Fee limit as percent of the amount
    pub fee_limit_percent: Option<i64>,
}

/// Candidate route
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    /// Cumulative time lock
    pub total_time_lock: u32,
    /// Routing fee in satoshis
    pub total_fees_sat: i64,
    /// Amount including fees in satoshis
    pub total_amount_sat: i64,
    /// Routing fee in millisatoshis
    pub total_fees_msat: i64,
    /// Number of hops
    pub hops: usize,
}

/// Wallet balance in satoshis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletBalance {
    /// Confirmed funds
    pub confirmed_sat: i64,
    /// Unconfirmed funds
    pub unconfirmed_sat: i64,
}
