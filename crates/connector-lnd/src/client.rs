//! GRPC Client

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use connector_common::bitcoin::hex::DisplayHex;
use futures::StreamExt;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TLSError, SignatureScheme};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::codegen::InterceptedService;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::lnrpc::fee_limit::Limit;
use crate::node::{
    AddInvoiceRequest, DynLightningNode, LightningNode, NodeChain, NodeConnector, NodeInfo, Route,
    RoutesRequest, SendRequest, SendResponse, SettlementEvent, SettlementStream, WalletBalance,
};
use crate::{lnrpc, Error};

/// Certificate verifier pinning lnd's self-signed certificate
#[derive(Debug)]
pub(crate) struct LndCertVerifier {
    certs: Vec<Vec<u8>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl LndCertVerifier {
    pub(crate) async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let provider = default_provider();

        let contents = read_file(path.as_ref()).await?;
        let mut reader = std::io::Cursor::new(contents);

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut reader).flatten().collect();
        if certs.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "No certificate found in `{}`",
                path.as_ref().display()
            )));
        }

        Ok(LndCertVerifier {
            certs: certs.into_iter().map(|c| c.to_vec()).collect(),
            provider: Arc::new(provider),
        })
    }
}

impl ServerCertVerifier for LndCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TLSError> {
        let mut presented: Vec<&[u8]> = intermediates.iter().map(|c| c.as_ref()).collect();
        presented.push(end_entity.as_ref());
        presented.sort();

        let mut pinned: Vec<&[u8]> = self.certs.iter().map(Vec::as_slice).collect();
        pinned.sort();

        if pinned != presented {
            return Err(TLSError::General(format!(
                "Server certificates do not match the pinned ones (pinned: {}, presented: {})",
                pinned.len(),
                presented.len()
            )));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TLSError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TLSError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
        .map(|_| HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

type LightningClient = lnrpc::lightning_client::LightningClient<
    InterceptedService<
        HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, Body>,
        MacaroonInterceptor,
    >,
>;

/// Supplies requests with the macaroon, when one is configured
#[derive(Debug, Clone)]
pub struct MacaroonInterceptor {
    macaroon: Option<String>,
}

impl Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(macaroon) = &self.macaroon {
            request.metadata_mut().insert(
                "macaroon",
                MetadataValue::from_str(macaroon)
                    .map_err(|e| Status::internal(format!("Invalid macaroon: {e}")))?,
            );
        }
        Ok(request)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).await.map_err(|source| Error::ReadFile {
        path: path.display().to_string(),
        source,
    })
}

async fn load_macaroon(path: impl AsRef<Path>) -> Result<String, Error> {
    let macaroon = read_file(path.as_ref()).await?;
    Ok(macaroon.to_lower_hex_string())
}

/// Open a client to the lnd node at `address`
pub async fn connect<P: AsRef<Path>>(
    address: &str,
    cert_path: P,
    macaroon_path: Option<P>,
) -> Result<LndClient, Error> {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(LndCertVerifier::load(cert_path).await?))
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_http2()
        .build();

    let client = HyperClient::builder(TokioExecutor::new())
        .http2_only(true)
        .build(https);

    let macaroon = match macaroon_path {
        Some(path) => Some(load_macaroon(path).await?),
        None => None,
    };

    let service = InterceptedService::new(client, MacaroonInterceptor { macaroon });

    let address = address
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let uri = http::Uri::from_str(&format!("https://{address}"))
        .map_err(|e| Error::InvalidConfig(format!("Invalid URI: {e}")))?;

    let lightning = LightningClient::with_origin(service, uri);

    Ok(LndClient {
        lightning: RwLock::new(Some(lightning)),
        closed: CancellationToken::new(),
    })
}

/// lnd client over gRPC.
///
/// Closing the client also aborts the calls and invoice streams in flight,
/// which then fail with [`Error::TransportClosed`].
#[derive(Debug)]
pub struct LndClient {
    lightning: RwLock<Option<LightningClient>>,
    closed: CancellationToken,
}

impl LndClient {
    fn lightning(&self) -> Result<LightningClient, Error> {
        self.lightning
            .read()
            .as_ref()
            .cloned()
            .ok_or(Error::TransportClosed)
    }

    async fn abortable<T, E>(&self, call: impl Future<Output = Result<T, E>>) -> Result<T, Error>
    where
        Error: From<E>,
    {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::TransportClosed),
            result = call => result.map_err(Error::from),
        }
    }
}

fn fee_limit_percent(percent: i64) -> lnrpc::FeeLimit {
    lnrpc::FeeLimit {
        limit: Some(Limit::Percent(percent)),
    }
}

impl From<lnrpc::GetInfoResponse> for NodeInfo {
    fn from(info: lnrpc::GetInfoResponse) -> Self {
        Self {
            identity_pubkey: info.identity_pubkey,
            alias: info.alias,
            num_active_channels: info.num_active_channels,
            num_peers: info.num_peers,
            block_height: info.block_height,
            block_hash: info.block_hash,
            synced_to_chain: info.synced_to_chain,
            testnet: info.testnet,
            uris: info.uris,
            version: info.version,
            chains: info
                .chains
                .into_iter()
                .map(|c| NodeChain {
                    chain: c.chain,
                    network: c.network,
                })
                .collect(),
        }
    }
}

impl From<lnrpc::Invoice> for SettlementEvent {
    fn from(invoice: lnrpc::Invoice) -> Self {
        Self {
            settled: invoice.settled || invoice.state() == lnrpc::InvoiceState::Settled,
            payment_request: invoice.payment_request,
            amount_paid_sat: invoice.amt_paid_sat,
            payment_hash: invoice.r_hash,
            receipt: invoice.receipt,
            memo: invoice.memo,
            value_sat: invoice.value,
        }
    }
}

impl From<lnrpc::Route> for Route {
    fn from(route: lnrpc::Route) -> Self {
        Self {
            total_time_lock: route.total_time_lock,
            total_fees_sat: route.total_fees,
            total_amount_sat: route.total_amt,
            total_fees_msat: route.total_fees_msat,
            hops: route.hops.len(),
        }
    }
}

#[async_trait]
impl LightningNode for LndClient {
    async fn get_info(&self) -> Result<NodeInfo, Error> {
        let info = self
            .abortable(self.lightning()?.get_info(lnrpc::GetInfoRequest {}))
            .await?
            .into_inner();

        Ok(info.into())
    }

    async fn add_invoice(&self, request: AddInvoiceRequest) -> Result<String, Error> {
        let invoice = lnrpc::Invoice {
            receipt: request.receipt,
            value: request.amount_sat,
            memo: request.memo,
            expiry: request.expiry_secs,
            ..Default::default()
        };

        let response = self
            .abortable(self.lightning()?.add_invoice(invoice))
            .await?
            .into_inner();

        Ok(response.payment_request)
    }

    async fn subscribe_settlements(&self) -> Result<SettlementStream, Error> {
        let subscription = lnrpc::InvoiceSubscription {
            add_index: 0,
            settle_index: 0,
        };
        let stream = self
            .abortable(self.lightning()?.subscribe_invoices(subscription))
            .await?
            .into_inner();

        Ok(stream
            .map(|update| update.map(SettlementEvent::from).map_err(Error::from))
            .take_until(self.closed.clone().cancelled_owned())
            .boxed())
    }

    async fn send_payment_sync(&self, request: SendRequest) -> Result<SendResponse, Error> {
        let send_request = lnrpc::SendRequest {
            payment_request: request.payment_request,
            amt: request.amount_sat.unwrap_or_default(),
            fee_limit: Some(fee_limit_percent(request.fee_limit_percent)),
            ..Default::default()
        };

        let response = self
            .abortable(self.lightning()?.send_payment_sync(send_request))
            .await?
            .into_inner();

        let (total_fees_sat, total_fees_msat) = response
            .payment_route
            .as_ref()
            .map_or((0, 0), |route| (route.total_fees, route.total_fees_msat));

        Ok(SendResponse {
            payment_error: response.payment_error,
            payment_preimage: response.payment_preimage,
            payment_hash: response.payment_hash,
            total_fees_sat,
            total_fees_msat,
        })
    }

    async fn query_routes(&self, request: RoutesRequest) -> Result<Vec<Route>, Error> {
        let query = lnrpc::QueryRoutesRequest {
            pub_key: request.pub_key,
            amt: request.amount_sat,
            num_routes: request.limit,
            fee_limit: request.fee_limit_percent.map(fee_limit_percent),
        };

        let mut lightning = self.lightning()?;
        let response = self
            .abortable(async move {
                lightning
                    .query_routes(query)
                    .await
                    .map_err(Error::RouteQuery)
            })
            .await?
            .into_inner();

        Ok(response.routes.into_iter().map(Route::from).collect())
    }

    async fn wallet_balance(&self) -> Result<WalletBalance, Error> {
        let balance = self
            .abortable(self.lightning()?.wallet_balance(lnrpc::WalletBalanceRequest {}))
            .await?
            .into_inner();

        Ok(WalletBalance {
            confirmed_sat: balance.confirmed_balance,
            unconfirmed_sat: balance.unconfirmed_balance,
        })
    }

    fn close(&self) {
        self.closed.cancel();
        if self.lightning.write().take().is_some() {
            tracing::debug!("LND: transport closed");
        }
    }
}

/// Connects to lnd over gRPC with the configured credentials
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    address: String,
    cert_path: PathBuf,
    macaroon_path: Option<PathBuf>,
}

impl GrpcConnector {
    /// Create new [`GrpcConnector`]
    pub fn new(address: String, cert_path: PathBuf, macaroon_path: Option<PathBuf>) -> Self {
        Self {
            address,
            cert_path,
            macaroon_path,
        }
    }
}

#[async_trait]
impl NodeConnector for GrpcConnector {
    async fn connect(&self) -> Result<DynLightningNode, Error> {
        let client = connect(
            &self.address,
            self.cert_path.as_path(),
            self.macaroon_path.as_deref(),
        )
        .await?;

        Ok(Arc::new(client))
    }
}
