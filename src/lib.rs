//! Nexxore Indexer - Multi-chain Vault Ledger
//!
//! Indexes vault deposits and withdrawals on EVM chains, Solana and Bitcoin
//! into one idempotent share ledger partitioned by (chain, asset).
//!
//! ## Components
//!
//! 1. **Watchers** - Fetch and normalize vault events per chain family
//! 2. **Ingestion** - Resumable backfill and live polling behind a durable cursor
//! 3. **Confirmation Tracker** - Promotes Bitcoin deposits and credits them exactly once
//! 4. **Reconciler** - Compares ledger totals with each vault's own share supply
//! 5. **Query API** - Balances, deposits, address registration and status over HTTP

pub mod api;
pub mod common;
pub mod confirmation;
pub mod health;
pub mod indexer;
pub mod reconciler;
pub mod service;
pub mod storage;
pub mod ticks;
pub mod types;
pub mod watcher;

// Re-exports: configuration and errors
pub use common::{IndexerConfig, IndexerError, Network, Result};

// Re-exports: ledger model
pub use types::{
    AddressBinding, ChainFamily, DepositRecord, DepositStatus, EventKind, LedgerKey, NormalizedEvent,
    ShareBalance, TxIdentifier, WithdrawalRecord,
};

// Re-exports: storage
pub use storage::{BindingStore, CursorStore, LedgerStore, MemoryStore, SqliteStore, StorageError};

// Re-exports: watchers
pub use watcher::{ChainWatcher, FetchedRange, SkippedUnit, WatcherError};

// Re-exports: pipeline and periodic tasks
pub use confirmation::{ConfirmationSource, ConfirmationTracker, CreditError, CreditNotice, CreditSink};
pub use health::{HealthRegistry, HealthSnapshot};
pub use indexer::{Backfill, Ingestor, LiveSubscription};
pub use reconciler::{ReconciliationReport, ReconciliationStatus, Reconciler};
pub use service::{IndexerService, Stores};
pub use ticks::{IntervalTicks, TickSource};
