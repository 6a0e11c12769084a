//! EVM Vault Watcher
//!
//! Reads ERC-4626 `Deposit` / `Withdraw` logs of one vault contract over
//! JSON-RPC. Identity is `(transactionHash, logIndex)`. The watcher never
//! reads past `head - finality_depth`, so everything it emits is final.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Filter, Log, TransactionRequest, H160, H256, U256, U64};
use ethers::utils::keccak256;

use super::{retry_transient, ChainWatcher, FetchedRange, RetryPolicy, WatcherError, WatcherResult};
use crate::types::{ChainFamily, DepositStatus, EventKind, LedgerKey, NormalizedEvent, TxIdentifier};

pub const DEPOSIT_SIGNATURE: &str = "Deposit(address,address,uint256,uint256)";
pub const WITHDRAW_SIGNATURE: &str = "Withdraw(address,address,address,uint256,uint256)";

pub fn deposit_topic() -> H256 {
    H256::from(keccak256(DEPOSIT_SIGNATURE))
}

pub fn withdraw_topic() -> H256 {
    H256::from(keccak256(WITHDRAW_SIGNATURE))
}

/// `totalSupply()` selector (0x18160ddd)
pub fn total_supply_selector() -> Vec<u8> {
    keccak256("totalSupply()")[..4].to_vec()
}

/// Build an HTTP provider whose requests time out
pub fn connect(rpc_url: &str, timeout: Duration) -> WatcherResult<Arc<Provider<Http>>> {
    let url = reqwest::Url::parse(rpc_url)
        .map_err(|e| WatcherError::Permanent(format!("invalid RPC url {}: {}", rpc_url, e)))?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| WatcherError::Permanent(format!("failed to build HTTP client: {}", e)))?;
    Ok(Arc::new(Provider::new(Http::new_with_client(url, client))))
}

fn provider_error(e: ProviderError) -> WatcherError {
    match e {
        ProviderError::SerdeJson(e) => WatcherError::Malformed(e.to_string()),
        other => WatcherError::Transient(other.to_string()),
    }
}

/// Watches one ERC-4626 vault on one EVM chain
pub struct EvmWatcher {
    provider: Arc<Provider<Http>>,
    key: LedgerKey,
    vault: Address,
    genesis: u64,
    chunk_size: u64,
    finality_depth: u64,
    live_overlap: u64,
    retry: RetryPolicy,
}

impl EvmWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<Provider<Http>>,
        key: LedgerKey,
        vault: &str,
        genesis: u64,
        chunk_size: u64,
        finality_depth: u64,
        live_overlap: u64,
        retry: RetryPolicy,
    ) -> WatcherResult<Self> {
        let vault: Address = vault
            .parse()
            .map_err(|_| WatcherError::Permanent(format!("invalid vault address: {}", vault)))?;

        Ok(Self {
            provider,
            key,
            vault,
            genesis,
            chunk_size: chunk_size.max(1),
            finality_depth,
            live_overlap,
            retry,
        })
    }

    /// Timestamps of the given blocks; blocks that cannot be read are left out
    async fn block_timestamps(&self, blocks: BTreeSet<u64>) -> HashMap<u64, i64> {
        let mut timestamps = HashMap::new();
        for number in blocks {
            let block = retry_transient(&self.retry, "block timestamp", || async move {
                self.provider.get_block(number).await.map_err(provider_error)
            })
            .await;

            match block {
                Ok(Some(block)) => {
                    timestamps.insert(number, block.timestamp.low_u64() as i64);
                }
                Ok(None) => tracing::debug!("Block {} not returned by {}", number, self.key.chain),
                Err(e) => tracing::warn!("Failed to read block {} on {}: {}", number, self.key.chain, e),
            }
        }
        timestamps
    }
}

#[async_trait]
impl ChainWatcher for EvmWatcher {
    fn key(&self) -> LedgerKey {
        self.key.clone()
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn genesis(&self) -> u64 {
        self.genesis
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn live_overlap(&self) -> u64 {
        self.live_overlap
    }

    async fn latest_position(&self) -> WatcherResult<u64> {
        let head = retry_transient(&self.retry, "block number", || async move {
            self.provider.get_block_number().await.map_err(provider_error)
        })
        .await?;
        Ok(head.as_u64().saturating_sub(self.finality_depth))
    }

    async fn fetch_historical_range(&self, from: u64, to: u64) -> WatcherResult<FetchedRange> {
        let filter = Filter::new().address(self.vault).from_block(from).to_block(to);
        let filter = &filter;
        let logs = retry_transient(&self.retry, "eth_getLogs", || async move {
            self.provider.get_logs(filter).await.map_err(provider_error)
        })
        .await
        .map_err(|e| {
            tracing::error!("get_logs failed on {} [{}, {}]: {}", self.key, from, to, e);
            e
        })?;

        let mut range = collect_vault_logs(&self.key, self.vault, self.finality_depth, logs);
        let blocks: BTreeSet<u64> = range.events.iter().map(|e| e.block_position).collect();
        let timestamps = self.block_timestamps(blocks).await;
        for event in &mut range.events {
            event.timestamp = timestamps.get(&event.block_position).copied().unwrap_or(0);
        }

        Ok(range)
    }

    /// `totalSupply()` of the vault at block `at`
    async fn authoritative_total_shares(&self, at: u64) -> WatcherResult<u128> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.vault)
            .data(total_supply_selector())
            .into();
        let tx = &tx;

        let output = retry_transient(&self.retry, "totalSupply", || async move {
            let block = BlockId::Number(BlockNumber::Number(U64::from(at)));
            self.provider.call(tx, Some(block)).await.map_err(provider_error)
        })
        .await?;

        if output.len() < 32 {
            return Err(WatcherError::Malformed(format!(
                "totalSupply returned {} bytes",
                output.len()
            )));
        }
        to_u128(U256::from_big_endian(&output[..32])).map_err(WatcherError::Malformed)
    }
}

/// Normalize the logs of one range
///
/// Logs from another contract and undecodable logs are skipped and reported;
/// the rest of the range is kept.
pub fn collect_vault_logs(key: &LedgerKey, vault: Address, finality_depth: u64, logs: Vec<Log>) -> FetchedRange {
    let mut range = FetchedRange::default();
    for log in logs {
        if log.removed == Some(true) {
            continue;
        }
        let unit = format!("{:?}:{:?}", log.transaction_hash, log.log_index);
        if log.address != vault {
            tracing::warn!("Skipping log {} from {:?} on {}: not the vault", unit, log.address, key);
            range.skip(unit, format!("log from {:?}, expected {:?}", log.address, vault));
            continue;
        }

        match decode_vault_log(key, &log) {
            Ok(Some(mut event)) => {
                event.confirmations = u32::try_from(finality_depth).unwrap_or(u32::MAX);
                range.events.push(event);
            }
            Ok(None) => {}
            Err(reason) => {
                tracing::warn!("Skipping malformed log {} on {}: {}", unit, key, reason);
                range.skip(unit, reason);
            }
        }
    }
    range
}

fn to_u128(value: U256) -> Result<u128, String> {
    if value > U256::from(u128::MAX) {
        return Err(format!("amount {} exceeds 128 bits", value));
    }
    Ok(value.as_u128())
}

fn word(data: &[u8], index: usize) -> Result<U256, String> {
    let start = index * 32;
    data.get(start..start + 32)
        .map(U256::from_big_endian)
        .ok_or_else(|| format!("data too short: {} bytes", data.len()))
}

/// Map a vault log to a normalized event
///
/// Returns `Ok(None)` for logs that are not vault Deposit/Withdraw events
/// (Transfer, Approval, ...).
pub fn decode_vault_log(key: &LedgerKey, log: &Log) -> Result<Option<NormalizedEvent>, String> {
    let (kind, owner_topic) = match log.topics.first() {
        Some(topic) if *topic == deposit_topic() => (EventKind::Deposit, 2),
        Some(topic) if *topic == withdraw_topic() => (EventKind::Withdrawal, 3),
        _ => return Ok(None),
    };

    let owner = log
        .topics
        .get(owner_topic)
        .ok_or_else(|| format!("expected {} topics, got {}", owner_topic + 1, log.topics.len()))?;
    let tx_hash = log.transaction_hash.ok_or("log without transaction hash")?;
    let log_index = log.log_index.ok_or("log without log index")?;
    let block_number = log.block_number.ok_or("log without block number")?;

    let assets = to_u128(word(&log.data, 0)?)?;
    let shares = to_u128(word(&log.data, 1)?)?;

    Ok(Some(NormalizedEvent {
        kind,
        key: key.clone(),
        user_address: format!("{:?}", H160::from(*owner)),
        deposit_address: None,
        tx: TxIdentifier::evm(format!("{:?}", tx_hash), log_index.low_u64()),
        assets_amount: assets,
        shares_amount: shares,
        timestamp: 0,
        confirmations: 0,
        status: DepositStatus::Confirmed,
        block_position: block_number.as_u64(),
    }))
}
