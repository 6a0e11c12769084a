//! Storage Trait Definitions
//!
//! Defines the durable collaborators of the ingestion pipeline:
//! - `CursorStore` - per (chain, asset) resume position
//! - `LedgerStore` - deposits, withdrawals and derived share balances
//! - `BindingStore` - Bitcoin deposit address ownership
//!
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AddressBinding, DepositRecord, LedgerKey, NormalizedEvent, ShareBalance, WithdrawalRecord};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// A write would break the ledger identity (e.g. negative balance)
    #[error("Ledger consistency fault: {0}")]
    LedgerConsistency(String),

    /// Cursor advance past the durably persisted range
    #[error("Cursor gap: {0}")]
    CursorGap(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A unit skipped while applying a batch because it would break the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerFault {
    pub tx_id: String,
    pub user_address: String,
    pub message: String,
}

/// Result of persisting one event range
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Deposits stored for the first time by this batch
    pub deposits_inserted: Vec<DepositRecord>,
    /// Withdrawals stored for the first time by this batch
    pub withdrawals_inserted: Vec<WithdrawalRecord>,
    /// Existing deposits whose confirmation state was refreshed
    pub updated: usize,
    /// Events that were already stored with identical state
    pub duplicates: usize,
    /// Withdrawals rejected because the balance would go negative
    pub faults: Vec<LedgerFault>,
}

impl BatchOutcome {
    pub fn inserted(&self) -> usize {
        self.deposits_inserted.len() + self.withdrawals_inserted.len()
    }

    /// First-inserted deposits that are already final, i.e. need a credit
    pub fn confirmed_first_inserts(&self) -> impl Iterator<Item = &DepositRecord> {
        self.deposits_inserted.iter().filter(|d| d.is_confirmed())
    }
}

/// Cursor and watermark state of one (chain, asset) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub key: LedgerKey,
    /// Last position the pipeline declared processed
    pub position: Option<u64>,
    /// Highest position whose range is durably stored
    pub persisted_through: Option<u64>,
}

/// Durable resume positions
///
/// `set_cursor` is only legal for positions already covered by a persisted
/// range (see `LedgerStore::apply_batch`); anything beyond is a
/// `StorageError::CursorGap`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last processed position, or `genesis` when none is stored
    async fn get_cursor(&self, key: &LedgerKey, genesis: u64) -> StorageResult<u64>;

    /// Advance the cursor; lower positions are ignored
    async fn set_cursor(&self, key: &LedgerKey, position: u64) -> StorageResult<()>;

    /// All known cursors
    async fn cursors(&self) -> StorageResult<Vec<CursorState>>;
}

/// Deposit/withdrawal records and share balances
///
/// Every write is idempotent on (chain, tx_id). Share balances count
/// confirmed deposits minus withdrawals and are maintained in the same
/// transaction as the record that changes them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store a deposit; true only for the call that inserted it
    async fn upsert_deposit(&self, record: &DepositRecord) -> StorageResult<bool>;

    /// Store a withdrawal; true only for the call that inserted it
    async fn upsert_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<bool>;

    /// Atomic increment; a result below zero is rejected
    async fn update_share_balance(&self, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128>;

    /// Persist a fetched range and mark `[from, through]` durable in one transaction
    async fn apply_batch(
        &self,
        key: &LedgerKey,
        events: &[NormalizedEvent],
        from: u64,
        through: u64,
    ) -> StorageResult<BatchOutcome>;

    async fn get_deposit(&self, chain: &str, tx_id: &str) -> StorageResult<Option<DepositRecord>>;

    async fn pending_deposits(&self, chain: &str) -> StorageResult<Vec<DepositRecord>>;

    /// Raise the stored confirmation count (never lowers it)
    async fn refresh_confirmations(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
        block_position: u64,
    ) -> StorageResult<()>;

    /// Check-and-set `pending -> confirmed` and credit the balance
    ///
    /// Returns the confirmed record only to the caller that performed the
    /// transition; every other caller gets `None`.
    async fn confirm_deposit(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
    ) -> StorageResult<Option<DepositRecord>>;

    async fn get_balance(&self, key: &LedgerKey, user: &str) -> StorageResult<u128>;

    /// Sum of all user balances for the pair
    async fn total_shares(&self, key: &LedgerKey) -> StorageResult<u128>;

    async fn balances(&self, key: &LedgerKey) -> StorageResult<Vec<ShareBalance>>;

    async fn deposits_by_address(&self, deposit_address: &str) -> StorageResult<Vec<DepositRecord>>;

    async fn deposits_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<DepositRecord>>;

    async fn withdrawals_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<WithdrawalRecord>>;
}

/// Bitcoin deposit address ownership
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Create a binding, or reactivate the caller's own inactive one
    ///
    /// An address bound to a different user is `StorageError::Duplicate`.
    async fn register_address(&self, binding: &AddressBinding) -> StorageResult<AddressBinding>;

    /// Flip `active` off; false when the address is unknown
    async fn deactivate_address(&self, deposit_address: &str) -> StorageResult<bool>;

    async fn active_bindings(&self) -> StorageResult<Vec<AddressBinding>>;

    /// Every binding ever registered, deactivated ones included
    async fn all_bindings(&self) -> StorageResult<Vec<AddressBinding>>;

    async fn binding_for(&self, deposit_address: &str) -> StorageResult<Option<AddressBinding>>;
}

/// Watermark after persisting `[from, through]`
///
/// Only a range contiguous with what is already durable (or the first range
/// for the pair) extends the watermark.
pub(crate) fn next_watermark(current: Option<u64>, cursor: Option<u64>, from: u64, through: u64) -> Option<u64> {
    let durable = match (current, cursor) {
        (Some(w), Some(c)) => Some(w.max(c)),
        (w, c) => w.or(c),
    };

    match durable {
        None => Some(through),
        Some(d) if from <= d.saturating_add(1) => Some(d.max(through)),
        Some(d) => Some(d),
    }
}

/// Balance after applying `delta`, or a consistency fault
pub(crate) fn apply_delta(key: &LedgerKey, user: &str, current: u128, delta: i128) -> StorageResult<u128> {
    let magnitude = delta.unsigned_abs();
    if delta >= 0 {
        current.checked_add(magnitude).ok_or_else(|| {
            StorageError::LedgerConsistency(format!("{} balance overflow for {}", key, user))
        })
    } else {
        current.checked_sub(magnitude).ok_or_else(|| {
            StorageError::LedgerConsistency(format!(
                "{} balance for {} would go negative: {} - {}",
                key, user, current, magnitude
            ))
        })
    }
}

/// Signed share delta as i128, rejecting values that do not fit
pub(crate) fn to_delta(shares: u128, negative: bool) -> StorageResult<i128> {
    let value = i128::try_from(shares)
        .map_err(|_| StorageError::InvalidData(format!("share amount too large: {}", shares)))?;
    Ok(if negative { -value } else { value })
}
