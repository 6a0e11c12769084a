//! Reconciler
//!
//! Compares the ledger's derived share total for a (chain, asset) pair with
//! the chain's own figure and reports the signed drift. Reports are
//! informational: nothing is corrected and ingestion is never paused.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{log_reconciliation_report, IndexerError, Result};
use crate::health::HealthRegistry;
use crate::storage::{CursorStore, LedgerStore};
use crate::ticks::TickSource;
use crate::types::units::{amount_string, signed_amount_string};
use crate::types::{signed_diff, LedgerKey};
use crate::watcher::ChainWatcher;

/// Outcome of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Match,
    Mismatch,
}

/// Structured reconciliation report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub id: String,
    pub chain: String,
    pub asset: String,
    /// Position the chain figure was read at
    pub position: u64,
    #[serde(with = "amount_string")]
    pub ledger_total: u128,
    #[serde(with = "amount_string")]
    pub chain_total: u128,
    /// chain_total - ledger_total
    #[serde(with = "signed_amount_string")]
    pub drift: i128,
    pub status: ReconciliationStatus,
    pub within_tolerance: bool,
    pub checked_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn new(key: &LedgerKey, position: u64, ledger_total: u128, chain_total: u128, tolerance: u128) -> Self {
        let drift = signed_diff(chain_total, ledger_total);
        Self {
            id: Uuid::new_v4().to_string(),
            chain: key.chain.clone(),
            asset: key.asset.clone(),
            position,
            ledger_total,
            chain_total,
            drift,
            status: if drift == 0 {
                ReconciliationStatus::Match
            } else {
                ReconciliationStatus::Mismatch
            },
            within_tolerance: drift.unsigned_abs() <= tolerance,
            checked_at: Utc::now(),
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.chain.clone(), self.asset.clone())
    }

    pub fn is_match(&self) -> bool {
        self.status == ReconciliationStatus::Match
    }
}

/// Ledger vs chain comparison for every watched pair
pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    cursors: Arc<dyn CursorStore>,
    watchers: BTreeMap<LedgerKey, Arc<dyn ChainWatcher>>,
    health: Arc<HealthRegistry>,
    tolerance: u128,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cursors: Arc<dyn CursorStore>,
        watchers: Vec<Arc<dyn ChainWatcher>>,
        health: Arc<HealthRegistry>,
        tolerance: u128,
    ) -> Self {
        let watchers = watchers.into_iter().map(|w| (w.key(), w)).collect();
        Self {
            ledger,
            cursors,
            watchers,
            health,
            tolerance,
        }
    }

    pub fn keys(&self) -> Vec<LedgerKey> {
        self.watchers.keys().cloned().collect()
    }

    /// Compare one pair at its current cursor
    pub async fn reconcile(&self, key: &LedgerKey) -> Result<ReconciliationReport> {
        let watcher = self
            .watchers
            .get(key)
            .ok_or_else(|| IndexerError::validation(format!("{} is not watched", key)))?;

        let position = self.cursors.get_cursor(key, watcher.genesis()).await?;
        let ledger_total = self.ledger.total_shares(key).await?;
        let chain_total = watcher.authoritative_total_shares(position).await?;

        let report = ReconciliationReport::new(key, position, ledger_total, chain_total, self.tolerance);
        log_reconciliation_report(
            &report.id,
            &key.to_string(),
            report.ledger_total,
            report.chain_total,
            report.drift,
            report.within_tolerance,
        );

        if !report.within_tolerance {
            self.health
                .record_fault(
                    key,
                    "LEDGER_CONSISTENCY_FAULT",
                    &format!(
                        "drift {} at position {} (ledger {}, chain {})",
                        report.drift, position, ledger_total, chain_total
                    ),
                )
                .await;
        }
        self.health.record_report(&report).await;

        Ok(report)
    }

    /// Reconcile every pair; a failing pair is recorded and skipped
    pub async fn reconcile_all(&self) -> Vec<ReconciliationReport> {
        let mut reports = Vec::with_capacity(self.watchers.len());
        for key in self.watchers.keys() {
            match self.reconcile(key).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!("Reconciliation of {} failed: {}", key, e);
                    self.health.record_fault(key, e.error_code(), &e.to_string()).await;
                }
            }
        }
        reports
    }

    /// Reconcile on every tick until cancelled
    pub async fn run<T: TickSource>(&self, mut ticks: T, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                more = ticks.tick() => {
                    if !more {
                        break;
                    }
                    self.reconcile_all().await;
                }
            }
        }
        tracing::info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{DepositStatus, EventKind, NormalizedEvent, TxIdentifier};
    use crate::watcher::{MockChainWatcher, WatcherError};

    fn key() -> LedgerKey {
        LedgerKey::new("ethereum", "USDC")
    }

    fn mock_watcher(chain_total: u128) -> MockChainWatcher {
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(100u64);
        watcher
            .expect_authoritative_total_shares()
            .returning(move |_| Ok(chain_total));
        watcher
    }

    async fn store_with_deposit(shares: u128) -> MemoryStore {
        let store = MemoryStore::default();
        let event = NormalizedEvent {
            kind: EventKind::Deposit,
            key: key(),
            user_address: "0xuser".to_string(),
            deposit_address: None,
            tx: TxIdentifier::evm("0xaaa", 0),
            assets_amount: shares,
            shares_amount: shares,
            timestamp: 0,
            confirmations: 12,
            status: DepositStatus::Confirmed,
            block_position: 110,
        };
        store.apply_batch(&key(), &[event], 101, 120).await.unwrap();
        store.set_cursor(&key(), 120).await.unwrap();
        store
    }

    fn reconciler(store: &MemoryStore, watcher: MockChainWatcher, tolerance: u128) -> (Reconciler, Arc<HealthRegistry>) {
        let health = Arc::new(HealthRegistry::new());
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            vec![Arc::new(watcher)],
            health.clone(),
            tolerance,
        );
        (reconciler, health)
    }

    #[test]
    fn test_report_drift_sign() {
        let report = ReconciliationReport::new(&key(), 10, 500, 450, 0);
        assert_eq!(report.drift, -50);
        assert_eq!(report.status, ReconciliationStatus::Mismatch);
        assert!(!report.within_tolerance);

        let report = ReconciliationReport::new(&key(), 10, 500, 510, 10);
        assert_eq!(report.drift, 10);
        assert!(report.within_tolerance);
    }

    #[test]
    fn test_report_serializes_amounts_as_strings() {
        let report = ReconciliationReport::new(&key(), 10, 500, 450, 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["drift"], "-50");
        assert_eq!(json["ledger_total"], "500");
        assert_eq!(json["status"], "mismatch");
    }

    #[tokio::test]
    async fn test_match_reads_chain_at_cursor() {
        let store = store_with_deposit(1_000).await;
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(100u64);
        watcher
            .expect_authoritative_total_shares()
            .withf(|at| *at == 120)
            .times(1)
            .returning(|_| Ok(1_000));
        let (reconciler, health) = reconciler(&store, watcher, 0);

        let report = reconciler.reconcile(&key()).await.unwrap();
        assert!(report.is_match());
        assert_eq!(report.position, 120);
        assert!(health.faults().await.is_empty());
        assert_eq!(
            health.pair(&key()).await.unwrap().last_reconciliation,
            Some(report)
        );
    }

    #[tokio::test]
    async fn test_mismatch_is_reported_as_fault() {
        let store = store_with_deposit(1_000).await;
        let (reconciler, health) = reconciler(&store, mock_watcher(1_250), 0);

        let report = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(report.drift, 250);

        let faults = health.faults().await;
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, "LEDGER_CONSISTENCY_FAULT");
        // the ledger is left untouched
        assert_eq!(store.total_shares(&key()).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_provider_failure_does_not_abort_other_pairs() {
        let store = store_with_deposit(1_000).await;
        let mut failing = MockChainWatcher::new();
        failing
            .expect_key()
            .returning(|| LedgerKey::new("base", "USDC"));
        failing.expect_genesis().return_const(0u64);
        failing
            .expect_authoritative_total_shares()
            .returning(|_| Err(WatcherError::Transient("timeout".into())));

        let health = Arc::new(HealthRegistry::new());
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            vec![Arc::new(failing), Arc::new(mock_watcher(1_000))],
            health.clone(),
            0,
        );

        let reports = reconciler.reconcile_all().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key(), key());
        assert_eq!(health.faults().await[0].code, "TRANSIENT_PROVIDER");
    }

    #[tokio::test]
    async fn test_unknown_pair_is_rejected() {
        let store = MemoryStore::default();
        let (reconciler, _) = reconciler(&store, mock_watcher(0), 0);
        let err = reconciler
            .reconcile(&LedgerKey::new("polygon", "DAI"))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Validation(_)));
    }
}
