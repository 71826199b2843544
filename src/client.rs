use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::Config;

/// One peer in a batch open request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOpenPeer {
    pub pubkey: String,
    pub amount_sats: u64,
}

/// A channel initiated but not yet funded. Cancellable without on-chain
/// cost until the funding transaction is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChannel {
    pub pubkey: String,
    pub pending_id: String,
    pub funding_address: String,
    pub amount_sats: u64,
}

/// An output of the batch funding transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount_sats: u64,
}

/// A signed funding transaction. `raw_tx` is present on transports that
/// require an explicit broadcast when publication was deferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTx {
    pub signed_psbt: String,
    pub raw_tx: Option<String>,
}

/// Trait abstracting the node API surface used by the batch opener.
///
/// This enables mock-based integration testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    /// Pubkeys of peers we already have an open or pending channel with.
    async fn get_open_channels(&self) -> anyhow::Result<Vec<String>>;
    /// Known network addresses for a peer, from the graph.
    async fn get_node_addresses(&self, pubkey: &str) -> anyhow::Result<Vec<String>>;
    async fn connect_peer(&self, pubkey: &str, address: &str) -> anyhow::Result<()>;
    /// Open channels to all peers in a single call with broadcast deferred.
    async fn batch_open_channels(
        &self,
        peers: &[BatchOpenPeer],
    ) -> anyhow::Result<Vec<PendingChannel>>;
    async fn fund_transaction(
        &self,
        outputs: &[TxOutput],
        fee_rate_sat_per_vb: u64,
    ) -> anyhow::Result<String>;
    async fn sign_transaction(&self, unsigned_psbt: &str) -> anyhow::Result<SignedTx>;
    async fn finalize_pending_channels(
        &self,
        pending_ids: &[String],
        signed_psbt: &str,
    ) -> anyhow::Result<()>;
    async fn broadcast_transaction(&self, raw_tx: &str) -> anyhow::Result<()>;
    async fn cancel_pending_channel(&self, pending_id: &str) -> anyhow::Result<()>;
}

const MAX_READ_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;

/// REST client for an LND-style node.
///
/// Idempotent reads are retried with exponential backoff. Mutating funding
/// calls are issued exactly once: the execution engine owns failure policy
/// for those, and a blind retry across a broadcast boundary could double
/// spend budget.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.node.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.node.tls_cert_path.display()
            )
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .context("Failed to parse node TLS certificate")?;

        let mut headers = reqwest::header::HeaderMap::new();
        let macaroon = reqwest::header::HeaderValue::from_str(&config.node.macaroon_hex)
            .map_err(|_| anyhow::anyhow!("macaroon_hex contains invalid header characters"))?;
        headers.insert("Grpc-Metadata-macaroon", macaroon);

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("https://{}", config.node.rest_host),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(name: &str, resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            debug!("{}: success", name);
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        // The body carries the node's error message; keep it intact for
        // the classifier.
        Err(anyhow::anyhow!("{} failed ({}): {}", name, status, body))
    }

    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        for attempt in 0..MAX_READ_RETRIES {
            match f().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt < MAX_READ_RETRIES - 1 {
                        let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                        warn!(
                            "{}: attempt {} failed ({:#}), retrying in {}ms",
                            name,
                            attempt + 1,
                            e,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    } else {
                        return Err(anyhow::anyhow!(
                            "{}: all {} attempts failed: {:#}",
                            name,
                            MAX_READ_RETRIES,
                            e
                        ));
                    }
                }
            }
        }
        unreachable!()
    }
}

// Wire shapes for the node's REST surface.

#[derive(Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<ChannelInfo>,
}

#[derive(Deserialize)]
struct ChannelInfo {
    remote_pubkey: String,
}

#[derive(Deserialize)]
struct PendingChannelsResponse {
    #[serde(default)]
    pending_open_channels: Vec<PendingOpenWrapper>,
}

#[derive(Deserialize)]
struct PendingOpenWrapper {
    channel: PendingChannelInfo,
}

#[derive(Deserialize)]
struct PendingChannelInfo {
    remote_node_pub: String,
}

#[derive(Deserialize)]
struct NodeInfoResponse {
    node: GraphNode,
}

#[derive(Deserialize)]
struct GraphNode {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Deserialize)]
struct NodeAddress {
    addr: String,
}

#[derive(Serialize)]
struct ConnectPeerRequest<'a> {
    addr: PeerAddr<'a>,
    perm: bool,
    timeout: u64,
}

#[derive(Serialize)]
struct PeerAddr<'a> {
    pubkey: &'a str,
    host: &'a str,
}

#[derive(Serialize)]
struct BatchOpenRequest<'a> {
    channels: Vec<BatchOpenChannel<'a>>,
    no_publish: bool,
}

#[derive(Serialize)]
struct BatchOpenChannel<'a> {
    node_pubkey: &'a str,
    local_funding_amount: u64,
}

#[derive(Deserialize)]
struct BatchOpenResponse {
    pending_channels: Vec<BatchPendingChannel>,
}

#[derive(Deserialize)]
struct BatchPendingChannel {
    pending_chan_id: String,
    remote_pubkey: String,
    funding_address: String,
    funding_amount: u64,
}

#[derive(Serialize)]
struct FundPsbtRequest {
    outputs: std::collections::BTreeMap<String, u64>,
    sat_per_vbyte: u64,
}

#[derive(Deserialize)]
struct FundPsbtResponse {
    funded_psbt: String,
}

#[derive(Serialize)]
struct FinalizePsbtRequest<'a> {
    funded_psbt: &'a str,
}

#[derive(Deserialize)]
struct FinalizePsbtResponse {
    signed_psbt: String,
    #[serde(default)]
    raw_final_tx: Option<String>,
}

#[derive(Serialize)]
struct FundingStepFinalize<'a> {
    psbt_finalize: PsbtFinalize<'a>,
}

#[derive(Serialize)]
struct PsbtFinalize<'a> {
    pending_chan_id: &'a str,
    signed_psbt: &'a str,
}

#[derive(Serialize)]
struct FundingStepCancel<'a> {
    shim_cancel: ShimCancel<'a>,
}

#[derive(Serialize)]
struct ShimCancel<'a> {
    pending_chan_id: &'a str,
}

#[derive(Serialize)]
struct PublishTxRequest<'a> {
    tx_hex: &'a str,
}

#[async_trait::async_trait]
impl NodeClient for LndRestClient {
    async fn get_open_channels(&self) -> anyhow::Result<Vec<String>> {
        self.with_retry("GetOpenChannels", || async {
            let resp = self.http.get(self.url("/v1/channels")).send().await?;
            let open: ListChannelsResponse = Self::check("ListChannels", resp).await?.json().await?;

            let resp = self.http.get(self.url("/v1/channels/pending")).send().await?;
            let pending: PendingChannelsResponse =
                Self::check("PendingChannels", resp).await?.json().await?;

            let mut peers: Vec<String> =
                open.channels.into_iter().map(|c| c.remote_pubkey).collect();
            peers.extend(
                pending
                    .pending_open_channels
                    .into_iter()
                    .map(|p| p.channel.remote_node_pub),
            );
            peers.sort();
            peers.dedup();
            Ok(peers)
        })
        .await
    }

    async fn get_node_addresses(&self, pubkey: &str) -> anyhow::Result<Vec<String>> {
        self.with_retry("GetNodeAddresses", || async {
            let resp = self
                .http
                .get(self.url(&format!("/v1/graph/node/{}", pubkey)))
                .send()
                .await?;
            let info: NodeInfoResponse = Self::check("GetNodeInfo", resp).await?.json().await?;
            Ok(info.node.addresses.into_iter().map(|a| a.addr).collect())
        })
        .await
    }

    async fn connect_peer(&self, pubkey: &str, address: &str) -> anyhow::Result<()> {
        // Not retried: the engine probes addresses with its own timeout and
        // fallback policy.
        let resp = self
            .http
            .post(self.url("/v1/peers"))
            .json(&ConnectPeerRequest {
                addr: PeerAddr { pubkey, host: address },
                perm: false,
                timeout: 15,
            })
            .send()
            .await?;
        Self::check("ConnectPeer", resp).await?;
        Ok(())
    }

    async fn batch_open_channels(
        &self,
        peers: &[BatchOpenPeer],
    ) -> anyhow::Result<Vec<PendingChannel>> {
        let request = BatchOpenRequest {
            channels: peers
                .iter()
                .map(|p| BatchOpenChannel {
                    node_pubkey: &p.pubkey,
                    local_funding_amount: p.amount_sats,
                })
                .collect(),
            no_publish: true,
        };
        let resp = self
            .http
            .post(self.url("/v1/channels/batch"))
            .json(&request)
            .send()
            .await?;
        let opened: BatchOpenResponse = Self::check("BatchOpenChannel", resp).await?.json().await?;
        Ok(opened
            .pending_channels
            .into_iter()
            .map(|p| PendingChannel {
                pubkey: p.remote_pubkey,
                pending_id: p.pending_chan_id,
                funding_address: p.funding_address,
                amount_sats: p.funding_amount,
            })
            .collect())
    }

    async fn fund_transaction(
        &self,
        outputs: &[TxOutput],
        fee_rate_sat_per_vb: u64,
    ) -> anyhow::Result<String> {
        let request = FundPsbtRequest {
            outputs: outputs
                .iter()
                .map(|o| (o.address.clone(), o.amount_sats))
                .collect(),
            sat_per_vbyte: fee_rate_sat_per_vb,
        };
        let resp = self
            .http
            .post(self.url("/v2/wallet/psbt/fund"))
            .json(&request)
            .send()
            .await?;
        let funded: FundPsbtResponse = Self::check("FundPsbt", resp).await?.json().await?;
        Ok(funded.funded_psbt)
    }

    async fn sign_transaction(&self, unsigned_psbt: &str) -> anyhow::Result<SignedTx> {
        let resp = self
            .http
            .post(self.url("/v2/wallet/psbt/finalize"))
            .json(&FinalizePsbtRequest { funded_psbt: unsigned_psbt })
            .send()
            .await?;
        let signed: FinalizePsbtResponse = Self::check("FinalizePsbt", resp).await?.json().await?;
        Ok(SignedTx {
            signed_psbt: signed.signed_psbt,
            raw_tx: signed.raw_final_tx,
        })
    }

    async fn finalize_pending_channels(
        &self,
        pending_ids: &[String],
        signed_psbt: &str,
    ) -> anyhow::Result<()> {
        for pending_id in pending_ids {
            let resp = self
                .http
                .post(self.url("/v2/funding/step"))
                .json(&FundingStepFinalize {
                    psbt_finalize: PsbtFinalize { pending_chan_id: pending_id, signed_psbt },
                })
                .send()
                .await?;
            Self::check("FundingStateStep", resp).await?;
        }
        Ok(())
    }

    async fn broadcast_transaction(&self, raw_tx: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.url("/v2/wallet/tx"))
            .json(&PublishTxRequest { tx_hex: raw_tx })
            .send()
            .await?;
        Self::check("PublishTransaction", resp).await?;
        Ok(())
    }

    async fn cancel_pending_channel(&self, pending_id: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.url("/v2/funding/step"))
            .json(&FundingStepCancel {
                shim_cancel: ShimCancel { pending_chan_id: pending_id },
            })
            .send()
            .await?;
        Self::check("FundingShimCancel", resp).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------
