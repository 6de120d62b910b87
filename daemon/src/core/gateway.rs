// Gateway Adapter (C3): the blockchain RPC surface (spec §4.3).
//
// One implementation, `HttpGatewayClient`, built the way the teacher builds
// its outbound HTTP client (`rpc::callback::CallbackService`): a `reqwest`
// client with a fixed timeout, JSON bodies, and a bounded retry loop with
// exponential backoff. `current_block_height` additionally goes through a
// single TTL-keyed cache cell (spec §9's "explicit TTL-keyed cell" note),
// guarded by a `tokio::sync::Mutex` so concurrent misses single-flight
// instead of all hitting the gateway at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use primitive_types::U256;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::error::{BundlerError, BundlerResult};

const RETRY_DELAYS_MS: [u64; 3] = [200, 1_000, 5_000];

/// A signed transaction header ready to post (spec §4.6 step 5: prepare
/// signs, post submits). Carried opaquely by the pipeline between those two
/// stages; only the gateway adapter and the prepare worker know its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxHeader {
    pub id: String,
    pub owner: Vec<u8>,
    pub target: Option<String>,
    pub quantity: U256,
    pub reward: U256,
    pub last_tx: String,
    pub data_size: u64,
    pub data_root: String,
    pub tags: Vec<(String, String)>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Found {
        confirmations: u64,
        block_height: u64,
    },
}

#[derive(Debug, Clone)]
pub struct GqlItemRecord {
    pub id: String,
    pub block_height: Option<u64>,
    pub bundled_in: Option<String>,
}

/// Blockchain RPC contract (spec §4.3). All calls carry the caller's
/// `network_request_timeout`; the adapter itself retries only on transient
/// failure (network error, 5xx, timeout), never on a well-formed rejection.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    async fn price_for_bytes(&self, n: u64) -> BundlerResult<U256>;
    async fn post_tx(&self, header: &TxHeader) -> BundlerResult<()>;
    async fn upload_chunks(
        &self,
        tx_id: &str,
        payload: &[u8],
    ) -> BundlerResult<()>;
    async fn tx_status(&self, id: &str) -> BundlerResult<TxStatus>;
    async fn current_block_height(&self) -> BundlerResult<u64>;
    /// The current anchor (`last_tx`) new transactions should reference
    /// (spec §4.6 step 4: "fetch reward and current last_tx anchor").
    async fn current_anchor(&self) -> BundlerResult<String>;
    async fn block_height_for_tx_anchor(&self, anchor: &str) -> BundlerResult<u64>;
    async fn data_items_on_gql(&self, ids: &[String]) -> BundlerResult<Vec<GqlItemRecord>>;
    async fn balance(&self, wallet: &str) -> BundlerResult<U256>;
    /// Current USD/AR exchange rate, recorded on `posted_bundle` rows for
    /// reporting (spec §4.7 step 3: "fetched opportunistically; failure to
    /// fetch rate is non-fatal"). Callers should treat an `Err` here as
    /// non-blocking.
    async fn usd_to_ar_rate(&self) -> BundlerResult<f64>;
}

/// Single-flight TTL cache for `current_block_height` (spec §9). One shared
/// process-local cell; the lock is held only across the cheap
/// staleness-check-then-maybe-refresh, not across the whole pipeline's use
/// of the value.
struct BlockHeightCache {
    ttl: Duration,
    state: Mutex<Option<(u64, Instant)>>,
}

impl BlockHeightCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
        }
    }

    async fn get_or_refresh<F, Fut>(&self, refresh: F) -> BundlerResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = BundlerResult<u64>>,
    {
        let mut guard = self.state.lock().await;
        if let Some((height, fetched_at)) = *guard {
            if fetched_at.elapsed() < self.ttl {
                return Ok(height);
            }
        }
        // Held across the refresh call: concurrent callers single-flight
        // behind this lock instead of duplicating the request.
        let height = refresh().await?;
        *guard = Some((height, Instant::now()));
        Ok(height)
    }
}

pub struct HttpGatewayClient {
    client: Client,
    base_url: String,
    block_height_cache: BlockHeightCache,
}

impl HttpGatewayClient {
    pub fn new(base_url: String, request_timeout: Duration, block_height_cache_ttl: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            block_height_cache: BlockHeightCache::new(block_height_cache_ttl),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> BundlerResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BundlerResult<T>>,
    {
        let mut last_err = None;
        for delay_ms in RETRY_DELAYS_MS.iter().copied() {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("gateway call failed, retrying in {delay_ms}ms: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        op().await.map_err(|e| last_err.unwrap_or(e))
    }
}

#[derive(Deserialize)]
struct PriceResponse {
    winston: String,
}

#[derive(Deserialize)]
struct TxStatusResponse {
    status: String,
    confirmations: Option<u64>,
    block_height: Option<u64>,
}

#[derive(Deserialize)]
struct BlockHeightResponse {
    height: u64,
}

#[derive(Deserialize)]
struct UsdToArResponse {
    rate: f64,
}

#[derive(Deserialize)]
struct AnchorResponse {
    anchor: String,
}

#[derive(Deserialize)]
struct GqlTransactionNode {
    id: String,
    block: Option<GqlBlockInfo>,
    bundled_in: Option<GqlBundledIn>,
}

#[derive(Deserialize)]
struct GqlBlockInfo {
    height: u64,
}

#[derive(Deserialize)]
struct GqlBundledIn {
    id: String,
}

#[derive(Deserialize)]
struct GqlResponse {
    data: GqlData,
}

#[derive(Deserialize)]
struct GqlData {
    transactions: GqlTransactionsEdgeSet,
}

#[derive(Deserialize)]
struct GqlTransactionsEdgeSet {
    edges: Vec<GqlEdge>,
}

#[derive(Deserialize)]
struct GqlEdge {
    node: GqlTransactionNode,
}

#[async_trait]
impl GatewayAdapter for HttpGatewayClient {
    async fn price_for_bytes(&self, n: u64) -> BundlerResult<U256> {
        self.with_retry(|| async {
            let url = format!("{}/price/{}", self.base_url, n);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            let body: PriceResponse = resp
                .json()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            U256::from_dec_str(&body.winston)
                .map_err(|e| BundlerError::Gateway(format!("bad price response: {e}")))
        })
        .await
    }

    async fn post_tx(&self, header: &TxHeader) -> BundlerResult<()> {
        self.with_retry(|| async {
            let url = format!("{}/tx", self.base_url);
            let body = serde_json::json!({
                "id": header.id,
                "owner": URL_SAFE_NO_PAD.encode(&header.owner),
                "target": header.target,
                "quantity": header.quantity.to_string(),
                "reward": header.reward.to_string(),
                "last_tx": header.last_tx,
                "data_size": header.data_size.to_string(),
                "data_root": header.data_root,
                "tags": header.tags,
                "signature": URL_SAFE_NO_PAD.encode(&header.signature),
            });
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            Ok(())
        })
        .await
    }

    async fn upload_chunks(&self, tx_id: &str, payload: &[u8]) -> BundlerResult<()> {
        self.with_retry(|| async {
            let url = format!("{}/chunk", self.base_url);
            let resp = self
                .client
                .post(&url)
                .header("x-tx-id", tx_id)
                .body(payload.to_vec())
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            Ok(())
        })
        .await
    }

    async fn tx_status(&self, id: &str) -> BundlerResult<TxStatus> {
        self.with_retry(|| async {
            let url = format!("{}/tx/{}/status", self.base_url, id);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(TxStatus::NotFound);
            }
            classify_gateway_response(&resp)?;
            let body: TxStatusResponse = resp
                .json()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            Ok(match body.status.as_str() {
                "pending" => TxStatus::Pending,
                "found" => TxStatus::Found {
                    confirmations: body.confirmations.unwrap_or(0),
                    block_height: body.block_height.unwrap_or(0),
                },
                _ => TxStatus::NotFound,
            })
        })
        .await
    }

    async fn current_block_height(&self) -> BundlerResult<u64> {
        self.block_height_cache
            .get_or_refresh(|| async {
                self.with_retry(|| async {
                    let url = format!("{}/height", self.base_url);
                    let resp = self
                        .client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| BundlerError::Gateway(e.to_string()))?;
                    classify_gateway_response(&resp)?;
                    let body: BlockHeightResponse = resp
                        .json()
                        .await
                        .map_err(|e| BundlerError::Gateway(e.to_string()))?;
                    Ok(body.height)
                })
                .await
            })
            .await
    }

    async fn current_anchor(&self) -> BundlerResult<String> {
        self.with_retry(|| async {
            let url = format!("{}/tx_anchor", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            let body: AnchorResponse = resp
                .json()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            Ok(body.anchor)
        })
        .await
    }

    async fn block_height_for_tx_anchor(&self, anchor: &str) -> BundlerResult<u64> {
        self.with_retry(|| async {
            let url = format!("{}/block/anchor/{}", self.base_url, anchor);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            let body: BlockHeightResponse = resp
                .json()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            Ok(body.height)
        })
        .await
    }

    async fn data_items_on_gql(&self, ids: &[String]) -> BundlerResult<Vec<GqlItemRecord>> {
        const PAGE_SIZE: usize = 100;
        let mut out = Vec::with_capacity(ids.len());
        for page in ids.chunks(PAGE_SIZE) {
            let page = page.to_vec();
            let records = self
                .with_retry(|| {
                    let page = page.clone();
                    async move {
                        let url = format!("{}/graphql", self.base_url);
                        let query = serde_json::json!({
                            "query": "query($ids: [ID!]) { transactions(ids: $ids) { edges { node { id block { height } bundledIn { id } } } } }",
                            "variables": { "ids": page },
                        });
                        let resp = self
                            .client
                            .post(&url)
                            .json(&query)
                            .send()
                            .await
                            .map_err(|e| BundlerError::Gateway(e.to_string()))?;
                        classify_gateway_response(&resp)?;
                        let body: GqlResponse = resp
                            .json()
                            .await
                            .map_err(|e| BundlerError::Gateway(e.to_string()))?;
                        Ok(body
                            .data
                            .transactions
                            .edges
                            .into_iter()
                            .map(|e| GqlItemRecord {
                                id: e.node.id,
                                block_height: e.node.block.map(|b| b.height),
                                bundled_in: e.node.bundled_in.map(|b| b.id),
                            })
                            .collect::<Vec<_>>())
                    }
                })
                .await?;
            out.extend(records);
        }
        Ok(out)
    }

    async fn balance(&self, wallet: &str) -> BundlerResult<U256> {
        self.with_retry(|| async {
            let url = format!("{}/wallet/{}/balance", self.base_url, wallet);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            let text = resp.text().await.map_err(|e| BundlerError::Gateway(e.to_string()))?;
            U256::from_dec_str(text.trim())
                .map_err(|e| BundlerError::Gateway(format!("bad balance response: {e}")))
        })
        .await
    }

    async fn usd_to_ar_rate(&self) -> BundlerResult<f64> {
        self.with_retry(|| async {
            let url = format!("{}/usd-to-ar", self.base_url);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            classify_gateway_response(&resp)?;
            let body: UsdToArResponse = resp
                .json()
                .await
                .map_err(|e| BundlerError::Gateway(e.to_string()))?;
            Ok(body.rate)
        })
        .await
    }
}

fn classify_gateway_response(resp: &reqwest::Response) -> BundlerResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(BundlerError::Gateway(format!("gateway returned {status}")));
    }
    Err(BundlerError::BadInput(format!(
        "gateway rejected request: {status}"
    )))
}

/// Shared handle type used by worker contexts.
pub type SharedGateway = Arc<dyn GatewayAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_height_cache_serves_within_ttl_without_refreshing() {
        let cache = BlockHeightCache::new(Duration::from_secs(60));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for expected_height in [100u64, 100u64] {
            let calls = calls.clone();
            let height = cache
                .get_or_refresh(|| async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(100)
                })
                .await
                .unwrap();
            assert_eq!(height, expected_height);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn block_height_cache_refreshes_after_ttl_elapses() {
        let cache = BlockHeightCache::new(Duration::from_millis(10));
        let first = cache.get_or_refresh(|| async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = cache.get_or_refresh(|| async { Ok(2) }).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
