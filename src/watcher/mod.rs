//! Chain Watchers
//!
//! One `ChainWatcher` per (chain, asset) pair. Each variant owns its chain's
//! identity scheme and failure handling and hands the pipeline
//! chain-agnostic `NormalizedEvent`s:
//! - `evm` - ERC-4626 vault logs, identity (transactionHash, logIndex)
//! - `solana` - Anchor vault program events, identity = transaction signature
//! - `bitcoin` - outputs paying registered deposit addresses, identity (txid, vout)

pub mod bitcoin;
pub mod esplora;
pub mod evm;
pub mod retry;
pub mod solana;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChainFamily, LedgerKey, NormalizedEvent};

pub use bitcoin::BitcoinWatcher;
pub use esplora::EsploraClient;
pub use evm::EvmWatcher;
pub use retry::{retry_transient, RetryPolicy};
pub use solana::SolanaWatcher;

/// Watcher errors, classified for retry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    /// Network, timeout or rate limit; retried with backoff
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Unparseable provider response or event payload
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Not worth retrying (bad request, missing account, bad config)
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl WatcherError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WatcherError::Transient(_))
    }
}

/// Result type for watcher operations
pub type WatcherResult<T> = Result<T, WatcherError>;

/// A unit (one transaction, one log, one address) left out of a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUnit {
    pub unit: String,
    pub reason: String,
}

/// Events of one historical range plus the units that could not be read
#[derive(Debug, Clone, Default)]
pub struct FetchedRange {
    pub events: Vec<NormalizedEvent>,
    pub skipped: Vec<SkippedUnit>,
}

impl FetchedRange {
    pub fn new(events: Vec<NormalizedEvent>) -> Self {
        Self {
            events,
            skipped: Vec::new(),
        }
    }

    pub(crate) fn skip(&mut self, unit: impl Into<String>, reason: impl Into<String>) {
        self.skipped.push(SkippedUnit {
            unit: unit.into(),
            reason: reason.into(),
        });
    }
}

/// Chain-specific source of vault activity for one (chain, asset) pair
///
/// Positions are block heights (EVM, Bitcoin) or slots (Solana).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// The ledger pair this watcher feeds
    fn key(&self) -> LedgerKey;

    fn family(&self) -> ChainFamily;

    /// Cursor value used when none is stored
    fn genesis(&self) -> u64;

    /// Maximum positions per historical fetch
    fn chunk_size(&self) -> u64;

    /// Positions re-fetched behind the cursor on every live poll
    fn live_overlap(&self) -> u64;

    /// Highest position the watcher treats as final
    async fn latest_position(&self) -> WatcherResult<u64>;

    /// Events in `[from, to]`
    ///
    /// An error means nothing in the range may be considered processed.
    /// Single unreadable units are reported in `FetchedRange::skipped`
    /// instead of failing the range.
    async fn fetch_historical_range(&self, from: u64, to: u64) -> WatcherResult<FetchedRange>;

    /// The chain's own share total for the pair, read as of position `at`
    /// where the chain supports historical reads
    async fn authoritative_total_shares(&self, at: u64) -> WatcherResult<u128>;
}
