//! Esplora HTTP Client
//!
//! Read-only client for the Esplora REST API used by the Bitcoin watcher and
//! the confirmation tracker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{WatcherError, WatcherResult};
use crate::confirmation::ConfirmationSource;

/// Confirmed transactions per `/txs/chain` page
pub const CHAIN_PAGE_SIZE: usize = 25;

/// Upper bound on history pages read for one address
pub const MAX_HISTORY_PAGES: usize = 40;

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str) -> WatcherResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await.map_err(classify_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, path));
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> WatcherResult<T> {
        let body = self
            .get(path)
            .await?
            .text()
            .await
            .map_err(classify_request_error)?;
        serde_json::from_str(&body)
            .map_err(|e| WatcherError::Malformed(format!("{}: {}", path, e)))
    }

    /// Get current block height
    pub async fn get_block_height(&self) -> WatcherResult<u64> {
        let text = self
            .get("/blocks/tip/height")
            .await?
            .text()
            .await
            .map_err(classify_request_error)?;

        text.trim()
            .parse()
            .map_err(|_| WatcherError::Malformed(format!("invalid tip height: {}", text)))
    }

    /// Funded/spent totals for an address
    pub async fn get_address_info(&self, address: &str) -> WatcherResult<AddressInfo> {
        self.get_json(&format!("/address/{}", address)).await
    }

    /// Get transaction status
    pub async fn get_tx_status(&self, txid: &str) -> WatcherResult<TxStatus> {
        self.get_json(&format!("/tx/{}/status", txid)).await
    }

    /// Full history of an address: mempool transactions first, then
    /// confirmed ones newest first, following `/txs/chain` pagination
    pub async fn get_address_txs(&self, address: &str) -> WatcherResult<Vec<EsploraTx>> {
        let mut txs: Vec<EsploraTx> = self.get_json(&format!("/address/{}/txs", address)).await?;

        let mut last_page_confirmed = txs.iter().filter(|tx| tx.status.confirmed).count();
        let mut pages = 1;

        while last_page_confirmed >= CHAIN_PAGE_SIZE && pages < MAX_HISTORY_PAGES {
            let last_seen = match txs.iter().rev().find(|tx| tx.status.confirmed) {
                Some(tx) => tx.txid.clone(),
                None => break,
            };

            let page: Vec<EsploraTx> = self
                .get_json(&format!("/address/{}/txs/chain/{}", address, last_seen))
                .await?;
            last_page_confirmed = page.iter().filter(|tx| tx.status.confirmed).count();
            txs.extend(page);
            pages += 1;
        }

        if pages >= MAX_HISTORY_PAGES {
            tracing::warn!(
                "History for {} truncated at {} pages ({} transactions)",
                address,
                pages,
                txs.len()
            );
        }

        Ok(txs)
    }
}

#[async_trait]
impl ConfirmationSource for EsploraClient {
    async fn tip_height(&self) -> WatcherResult<u64> {
        self.get_block_height().await
    }

    async fn tx_block_height(&self, tx_id: &str) -> WatcherResult<Option<u64>> {
        // Ledger ids are "txid:vout"
        let txid = tx_id.rsplit_once(':').map(|(txid, _)| txid).unwrap_or(tx_id);
        let status = self.get_tx_status(txid).await?;
        Ok(if status.confirmed { status.block_height } else { None })
    }
}

fn classify_request_error(e: reqwest::Error) -> WatcherError {
    if e.is_decode() {
        WatcherError::Malformed(e.to_string())
    } else {
        WatcherError::Transient(e.to_string())
    }
}

fn classify_status(status: StatusCode, path: &str) -> WatcherError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        WatcherError::Transient(format!("{} returned {}", path, status))
    } else if status == StatusCode::NOT_FOUND {
        WatcherError::Permanent(format!("{} not found", path))
    } else {
        WatcherError::Permanent(format!("{} returned {}", path, status))
    }
}

/// Transaction status
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
}

/// Transaction output
#[derive(Debug, Clone, Deserialize)]
pub struct TxOut {
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

/// Transaction as returned by the address history endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    pub txid: String,
    #[serde(default)]
    pub vout: Vec<TxOut>,
    #[serde(default)]
    pub status: TxStatus,
}

/// Address statistics
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressStats {
    pub funded_txo_count: u64,
    pub funded_txo_sum: u64,
    pub spent_txo_count: u64,
    pub spent_txo_sum: u64,
    pub tx_count: u64,
}

/// Address information
#[derive(Debug, Clone, Deserialize)]
pub struct AddressInfo {
    pub address: String,
    #[serde(default)]
    pub chain_stats: AddressStats,
    #[serde(default)]
    pub mempool_stats: AddressStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};

    fn tx_json(txid: &str, confirmed: bool, height: u64) -> serde_json::Value {
        let block_height = confirmed.then_some(height);
        serde_json::json!({
            "txid": txid,
            "vout": [{ "scriptpubkey_address": "tb1qwatched", "value": 1000 }],
            "status": { "confirmed": confirmed, "block_height": block_height }
        })
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_tx_with_mempool_status() {
        let raw = r#"{
            "txid": "abcd",
            "version": 2,
            "vout": [
                {"scriptpubkey": "0014", "scriptpubkey_address": "tb1qexample", "value": 50000},
                {"scriptpubkey": "6a", "value": 0}
            ],
            "status": {"confirmed": false}
        }"#;
        let tx: EsploraTx = serde_json::from_str(raw).unwrap();

        assert_eq!(tx.txid, "abcd");
        assert_eq!(tx.vout.len(), 2);
        assert_eq!(tx.vout[0].value, 50_000);
        assert!(tx.vout[1].scriptpubkey_address.is_none());
        assert!(!tx.status.confirmed);
        assert!(tx.status.block_height.is_none());
    }

    #[test]
    fn test_parse_address_info() {
        let raw = r#"{
            "address": "tb1qexample",
            "chain_stats": {"funded_txo_count": 2, "funded_txo_sum": 150000, "spent_txo_count": 0, "spent_txo_sum": 0, "tx_count": 2},
            "mempool_stats": {"funded_txo_count": 0, "funded_txo_sum": 0, "spent_txo_count": 0, "spent_txo_sum": 0, "tx_count": 0}
        }"#;
        let info: AddressInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.chain_stats.funded_txo_sum, 150_000);
        assert_eq!(info.mempool_stats.tx_count, 0);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "/x").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "/x").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "/x"),
            WatcherError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "/x"),
            WatcherError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_tip_height_and_tx_status() {
        let app = Router::new()
            .route("/blocks/tip/height", get(|| async { "812345" }))
            .route(
                "/tx/:txid/status",
                get(|Path(txid): Path<String>| async move {
                    if txid == "aa" {
                        Json(serde_json::json!({"confirmed": true, "block_height": 812340}))
                    } else {
                        Json(serde_json::json!({"confirmed": false}))
                    }
                }),
            );
        let client = EsploraClient::new(&serve(app).await, Duration::from_secs(5));

        assert_eq!(client.tip_height().await.unwrap(), 812_345);
        assert_eq!(client.tx_block_height("aa:0").await.unwrap(), Some(812_340));
        assert_eq!(client.tx_block_height("bb:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_address_history_follows_chain_pages() {
        let app = Router::new()
            .route(
                "/address/:addr/txs",
                get(|| async {
                    let mut page = vec![tx_json("mempool", false, 0)];
                    page.extend((0..25).map(|i| tx_json(&format!("first{}", i), true, 1000 - i)));
                    Json(serde_json::Value::Array(page))
                }),
            )
            .route(
                "/address/:addr/txs/chain/:last",
                get(|Path((_, last)): Path<(String, String)>| async move {
                    assert_eq!(last, "first24");
                    let page: Vec<_> = (0..3).map(|i| tx_json(&format!("second{}", i), true, 900 - i)).collect();
                    Json(serde_json::Value::Array(page))
                }),
            );
        let client = EsploraClient::new(&serve(app).await, Duration::from_secs(5));

        let txs = client.get_address_txs("tb1qwatched").await.unwrap();
        assert_eq!(txs.len(), 29);
        assert_eq!(txs[0].txid, "mempool");
        assert_eq!(txs[28].txid, "second2");
    }

    #[tokio::test]
    async fn test_unknown_address_is_permanent() {
        let client = EsploraClient::new(&serve(Router::new()).await, Duration::from_secs(5));
        let err = client.get_address_info("tb1qmissing").await.unwrap_err();
        assert!(matches!(err, WatcherError::Permanent(_)));
    }
}
