//! Bitcoin Deposit-Address Watcher
//!
//! Bitcoin has no log stream: every pass enumerates the full history of each
//! active deposit address and emits one PENDING deposit per output paying it.
//! Re-sighting is harmless since `(txid, vout)` upserts are idempotent; the
//! confirmation tracker promotes deposits once they are deep enough.

use std::sync::Arc;

use async_trait::async_trait;

use super::esplora::{EsploraClient, EsploraTx};
use super::{retry_transient, ChainWatcher, FetchedRange, RetryPolicy, WatcherError, WatcherResult};
use crate::confirmation::confirmations_at;
use crate::storage::BindingStore;
use crate::types::{
    AddressBinding, ChainFamily, DepositStatus, EventKind, LedgerKey, NormalizedEvent, TxIdentifier,
    BITCOIN_CHAIN, BTC_ASSET,
};

/// Watches every active `AddressBinding` through Esplora
pub struct BitcoinWatcher {
    client: EsploraClient,
    bindings: Arc<dyn BindingStore>,
    genesis: u64,
    confirmations_required: u32,
    live_overlap: u64,
    retry: RetryPolicy,
}

impl BitcoinWatcher {
    pub fn new(
        client: EsploraClient,
        bindings: Arc<dyn BindingStore>,
        genesis: u64,
        confirmations_required: u32,
        live_overlap: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            bindings,
            genesis,
            confirmations_required,
            live_overlap,
            retry,
        }
    }

    pub fn client(&self) -> &EsploraClient {
        &self.client
    }

    async fn active_bindings(&self) -> WatcherResult<Vec<AddressBinding>> {
        self.bindings
            .active_bindings()
            .await
            .map_err(|e| WatcherError::Permanent(format!("failed to read bindings: {}", e)))
    }

    async fn address_txs(&self, address: &str) -> WatcherResult<Vec<EsploraTx>> {
        retry_transient(&self.retry, "address history", || async move {
            self.client.get_address_txs(address).await
        })
        .await
    }
}

#[async_trait]
impl ChainWatcher for BitcoinWatcher {
    fn key(&self) -> LedgerKey {
        LedgerKey::new(BITCOIN_CHAIN, BTC_ASSET)
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Bitcoin
    }

    fn genesis(&self) -> u64 {
        self.genesis
    }

    /// Every pass is a full rescan, so one pass covers any range
    fn chunk_size(&self) -> u64 {
        u64::MAX
    }

    fn live_overlap(&self) -> u64 {
        self.live_overlap
    }

    async fn latest_position(&self) -> WatcherResult<u64> {
        retry_transient(&self.retry, "tip height", || async move { self.client.get_block_height().await }).await
    }

    /// Full rescan of the active addresses, `to` taken as the tip
    ///
    /// An address whose history cannot be read is skipped and reported; the
    /// next pass picks it up again.
    async fn fetch_historical_range(&self, _from: u64, to: u64) -> WatcherResult<FetchedRange> {
        let mut range = FetchedRange::default();

        for binding in self.active_bindings().await? {
            match self.address_txs(&binding.deposit_address).await {
                Ok(txs) => range.events.extend(deposits_from_txs(&binding, &txs, to)),
                Err(e) => {
                    tracing::warn!("Skipping address {}: {}", binding.deposit_address, e);
                    range.skip(binding.deposit_address.clone(), e.to_string());
                }
            }
        }

        Ok(range)
    }

    /// Satoshis paid to every registered address with at least the required
    /// confirmations as of height `at`
    ///
    /// Deactivated addresses still count: deposits credited before the
    /// deactivation stay in the ledger.
    async fn authoritative_total_shares(&self, at: u64) -> WatcherResult<u128> {
        let bindings = self
            .bindings
            .all_bindings()
            .await
            .map_err(|e| WatcherError::Permanent(format!("failed to read bindings: {}", e)))?;

        let mut total: u128 = 0;
        for binding in bindings {
            let txs = self.address_txs(&binding.deposit_address).await?;
            total += confirmed_total(&binding.deposit_address, &txs, at, self.confirmations_required);
        }
        Ok(total)
    }
}

/// Outputs of `txs` paying `address`, as (vout, value, tx)
fn outputs_to<'a>(address: &'a str, txs: &'a [EsploraTx]) -> impl Iterator<Item = (u32, u64, &'a EsploraTx)> + 'a {
    txs.iter().flat_map(move |tx| {
        tx.vout.iter().enumerate().filter_map(move |(vout, out)| {
            let paid = out.scriptpubkey_address.as_deref() == Some(address);
            let vout = u32::try_from(vout).ok()?;
            paid.then_some((vout, out.value, tx))
        })
    })
}

/// One PENDING deposit per output paying the binding's address
pub fn deposits_from_txs(binding: &AddressBinding, txs: &[EsploraTx], tip: u64) -> Vec<NormalizedEvent> {
    outputs_to(&binding.deposit_address, txs)
        .map(|(vout, value, tx)| {
            let height = if tx.status.confirmed { tx.status.block_height } else { None };
            NormalizedEvent {
                kind: EventKind::Deposit,
                key: LedgerKey::new(BITCOIN_CHAIN, BTC_ASSET),
                user_address: binding.user_address.clone(),
                deposit_address: Some(binding.deposit_address.clone()),
                tx: TxIdentifier::bitcoin(tx.txid.clone(), vout),
                assets_amount: value as u128,
                shares_amount: value as u128,
                timestamp: tx.status.block_time.map(|t| t as i64).unwrap_or(0),
                confirmations: confirmations_at(tip, height),
                status: DepositStatus::Pending,
                block_position: height.unwrap_or(0),
            }
        })
        .collect()
}

/// Value paid to `address` with at least `required` confirmations at `tip`
pub fn confirmed_total(address: &str, txs: &[EsploraTx], tip: u64, required: u32) -> u128 {
    outputs_to(address, txs)
        .filter(|(_, _, tx)| {
            let height = if tx.status.confirmed { tx.status.block_height } else { None };
            height.is_some_and(|h| h <= tip) && confirmations_at(tip, height) >= required
        })
        .map(|(_, value, _)| value as u128)
        .sum()
}
