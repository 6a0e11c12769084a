//! Ledger Types
//!
//! Normalized events produced by watchers and the records they become once
//! stored. A deposit moves `pending -> confirmed` at most once; withdrawals
//! have no confirmation lifecycle.

use serde::{Deserialize, Serialize};

use super::chain::{LedgerKey, TxIdentifier};
use super::units::amount_string;

/// Status of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Seen on chain, below the confirmation threshold
    Pending,
    /// Final; counted in the share balance
    Confirmed,
}

impl Default for DepositStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Direction of a vault event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Deposit,
    Withdrawal,
}

/// Chain-agnostic event emitted by a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub key: LedgerKey,
    pub user_address: String,
    /// Watched address that received the funds (Bitcoin only)
    pub deposit_address: Option<String>,
    pub tx: TxIdentifier,
    pub assets_amount: u128,
    pub shares_amount: u128,
    /// Unix seconds; 0 when the chain does not report it yet (mempool)
    pub timestamp: i64,
    pub confirmations: u32,
    pub status: DepositStatus,
    /// Block height or slot; 0 when unconfirmed
    pub block_position: u64,
}

impl NormalizedEvent {
    pub fn to_deposit(&self) -> DepositRecord {
        DepositRecord {
            chain: self.key.chain.clone(),
            asset: self.key.asset.clone(),
            user_address: self.user_address.clone(),
            deposit_address: self.deposit_address.clone(),
            tx_id: self.tx.canonical(),
            assets_amount: self.assets_amount,
            shares_amount: self.shares_amount,
            timestamp: self.timestamp,
            confirmations: self.confirmations,
            status: self.status,
            block_position: self.block_position,
        }
    }

    pub fn to_withdrawal(&self) -> WithdrawalRecord {
        WithdrawalRecord {
            chain: self.key.chain.clone(),
            asset: self.key.asset.clone(),
            user_address: self.user_address.clone(),
            tx_id: self.tx.canonical(),
            assets_amount: self.assets_amount,
            shares_amount: self.shares_amount,
            timestamp: self.timestamp,
            block_position: self.block_position,
        }
    }
}

/// Stored deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub chain: String,
    pub asset: String,
    pub user_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
    /// Canonical `TxIdentifier`, unique within `chain`
    pub tx_id: String,
    #[serde(with = "amount_string")]
    pub assets_amount: u128,
    #[serde(with = "amount_string")]
    pub shares_amount: u128,
    pub timestamp: i64,
    pub confirmations: u32,
    pub status: DepositStatus,
    pub block_position: u64,
}

impl DepositRecord {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.chain, &self.asset)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == DepositStatus::Confirmed
    }

    /// Merge a re-sighting of the same deposit
    ///
    /// Keeps the higher confirmation count and never moves status backwards.
    /// Status only advances through the confirmation check-and-set, so a
    /// re-sighting never promotes on its own. Returns true when anything
    /// changed.
    pub fn merge_sighting(&mut self, other: &DepositRecord) -> bool {
        let mut changed = false;

        if other.confirmations > self.confirmations {
            self.confirmations = other.confirmations;
            changed = true;
        }
        if self.block_position == 0 && other.block_position > 0 {
            self.block_position = other.block_position;
            changed = true;
        }
        if self.timestamp == 0 && other.timestamp > 0 {
            self.timestamp = other.timestamp;
            changed = true;
        }

        changed
    }
}

/// Stored withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub chain: String,
    pub asset: String,
    pub user_address: String,
    pub tx_id: String,
    #[serde(with = "amount_string")]
    pub assets_amount: u128,
    #[serde(with = "amount_string")]
    pub shares_amount: u128,
    pub timestamp: i64,
    pub block_position: u64,
}

impl WithdrawalRecord {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.chain, &self.asset)
    }
}

/// Derived per-user share balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBalance {
    pub chain: String,
    pub asset: String,
    pub user_address: String,
    #[serde(with = "amount_string")]
    pub shares: u128,
}
