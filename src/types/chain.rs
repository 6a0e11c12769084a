//! Chain Identity Types
//!
//! A ledger is partitioned by (chain, asset). Each chain family identifies
//! activity differently, and `TxIdentifier` folds the three schemes into a
//! single canonical string that is unique within one chain.

use serde::{Deserialize, Serialize};

/// Ledger chain name used for the Solana program
pub const SOLANA_CHAIN: &str = "solana";

/// Ledger chain name used for Bitcoin deposit addresses
pub const BITCOIN_CHAIN: &str = "bitcoin";

/// Asset symbol recorded for Bitcoin deposits
pub const BTC_ASSET: &str = "BTC";

/// Chain family, selecting the watcher variant and identity scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Evm,
    Solana,
    Bitcoin,
}

impl std::fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Evm => "evm",
            Self::Solana => "solana",
            Self::Bitcoin => "bitcoin",
        };
        write!(f, "{}", s)
    }
}

/// (chain, asset) pair; the unit of work for watchers, cursors and reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub chain: String,
    pub asset: String,
}

impl LedgerKey {
    pub fn new(chain: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            asset: asset.into(),
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.chain, self.asset)
    }
}

/// Per-chain identity of one deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TxIdentifier {
    /// EVM log: (transactionHash, logIndex)
    Evm { tx_hash: String, log_index: u64 },
    /// Solana: one vault event per transaction signature
    Solana { signature: String },
    /// Bitcoin output: (txid, vout)
    Bitcoin { txid: String, vout: u32 },
}

impl TxIdentifier {
    pub fn evm(tx_hash: impl Into<String>, log_index: u64) -> Self {
        Self::Evm {
            tx_hash: tx_hash.into().to_lowercase(),
            log_index,
        }
    }

    pub fn solana(signature: impl Into<String>) -> Self {
        Self::Solana {
            signature: signature.into(),
        }
    }

    pub fn bitcoin(txid: impl Into<String>, vout: u32) -> Self {
        Self::Bitcoin {
            txid: txid.into().to_lowercase(),
            vout,
        }
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            Self::Evm { .. } => ChainFamily::Evm,
            Self::Solana { .. } => ChainFamily::Solana,
            Self::Bitcoin { .. } => ChainFamily::Bitcoin,
        }
    }

    /// Canonical storage key, unique per chain
    ///
    /// EVM hashes and Bitcoin txids are lowercased on construction so the
    /// same activity reported by two providers maps to one key.
    pub fn canonical(&self) -> String {
        match self {
            Self::Evm { tx_hash, log_index } => format!("{}:{}", tx_hash, log_index),
            Self::Solana { signature } => signature.clone(),
            Self::Bitcoin { txid, vout } => format!("{}:{}", txid, vout),
        }
    }

    /// The underlying transaction id (without the log/output index)
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Evm { tx_hash, .. } => tx_hash,
            Self::Solana { signature } => signature,
            Self::Bitcoin { txid, .. } => txid,
        }
    }
}

impl std::fmt::Display for TxIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
