//! Shared Types Module
//!
//! Data types shared across the indexer.

pub mod binding;
pub mod chain;
pub mod ledger;
pub mod units;

// Re-exports for convenience
pub use binding::AddressBinding;
pub use chain::{ChainFamily, LedgerKey, TxIdentifier, BITCOIN_CHAIN, BTC_ASSET, SOLANA_CHAIN};
pub use ledger::{
    DepositRecord, DepositStatus, EventKind, NormalizedEvent, ShareBalance, WithdrawalRecord,
};
pub use units::{parse_amount, signed_diff};
