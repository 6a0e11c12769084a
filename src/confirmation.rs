//! Confirmation Tracking and Crediting
//!
//! Deposits on probabilistic-finality chains (Bitcoin) are stored PENDING.
//! Every poll recomputes their confirmations from the chain tip and moves
//! those past the threshold to CONFIRMED through the store's check-and-set;
//! only the caller that wins the transition delivers the credit, so a
//! credit fires once even when polls overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::common::{log_credit_event, Result};
use crate::health::HealthRegistry;
use crate::storage::LedgerStore;
use crate::ticks::TickSource;
use crate::types::units::amount_string;
use crate::types::{DepositRecord, LedgerKey};
use crate::watcher::{retry_transient, RetryPolicy, WatcherResult};

/// Chain tip and per-transaction inclusion height
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn tip_height(&self) -> WatcherResult<u64>;

    /// Height of the block containing `tx_id`; `None` while unconfirmed
    async fn tx_block_height(&self, tx_id: &str) -> WatcherResult<Option<u64>>;
}

/// Number of confirmations given the tip and the containing block height
pub fn confirmations_at(tip: u64, block_height: Option<u64>) -> u32 {
    match block_height {
        Some(height) if height <= tip => u32::try_from(tip - height + 1).unwrap_or(u32::MAX),
        Some(_) => 1,
        None => 0,
    }
}

/// Credit delivered downstream once per confirmed deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNotice {
    pub chain: String,
    pub asset: String,
    pub user_address: String,
    pub deposit_address: Option<String>,
    pub tx_id: String,
    #[serde(with = "amount_string")]
    pub assets_amount: u128,
    #[serde(with = "amount_string")]
    pub shares_amount: u128,
    pub confirmations: u32,
}

impl From<&DepositRecord> for CreditNotice {
    fn from(record: &DepositRecord) -> Self {
        Self {
            chain: record.chain.clone(),
            asset: record.asset.clone(),
            user_address: record.user_address.clone(),
            deposit_address: record.deposit_address.clone(),
            tx_id: record.tx_id.clone(),
            assets_amount: record.assets_amount,
            shares_amount: record.shares_amount,
            confirmations: record.confirmations,
        }
    }
}

/// Credit delivery errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreditError {
    #[error("credit delivery failed: {0}")]
    Unavailable(String),

    #[error("credit rejected: {0}")]
    Rejected(String),
}

/// Downstream accounting hook
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditSink: Send + Sync {
    async fn credit(&self, notice: &CreditNotice) -> std::result::Result<(), CreditError>;
}

/// Sink that only logs; used when no webhook is configured
#[derive(Debug, Default, Clone)]
pub struct LoggingCreditSink;

#[async_trait]
impl CreditSink for LoggingCreditSink {
    async fn credit(&self, notice: &CreditNotice) -> std::result::Result<(), CreditError> {
        tracing::info!(
            "Credit {} {} shares to {} ({})",
            notice.shares_amount,
            notice.asset,
            notice.user_address,
            notice.tx_id
        );
        Ok(())
    }
}

/// Sink that POSTs each notice as JSON
#[derive(Debug, Clone)]
pub struct WebhookCreditSink {
    client: Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookCreditSink {
    pub fn new(url: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            url: url.to_string(),
            retry,
        }
    }

    async fn post(&self, notice: &CreditNotice) -> std::result::Result<(), CreditError> {
        let resp = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| CreditError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(CreditError::Unavailable(format!("webhook returned {}", status)))
        } else {
            Err(CreditError::Rejected(format!("webhook returned {}", status)))
        }
    }
}

#[async_trait]
impl CreditSink for WebhookCreditSink {
    async fn credit(&self, notice: &CreditNotice) -> std::result::Result<(), CreditError> {
        backoff::future::retry(self.retry.backoff(), || async move {
            self.post(notice).await.map_err(|e| match e {
                CreditError::Unavailable(_) => backoff::Error::transient(e),
                CreditError::Rejected(_) => backoff::Error::permanent(e),
            })
        })
        .await
    }
}

/// Deliver the credit for a deposit that just became confirmed
///
/// A failed delivery is logged and recorded as a fault; it is never retried
/// by re-running the status transition.
pub async fn deliver_credit(sink: &dyn CreditSink, health: &HealthRegistry, record: &DepositRecord) -> bool {
    let notice = CreditNotice::from(record);
    let key = record.key().to_string();

    match sink.credit(&notice).await {
        Ok(()) => {
            log_credit_event(&key, &record.tx_id, &record.user_address, record.shares_amount, true, None);
            true
        }
        Err(e) => {
            let message = e.to_string();
            log_credit_event(
                &key,
                &record.tx_id,
                &record.user_address,
                record.shares_amount,
                false,
                Some(&message),
            );
            health
                .record_fault(&record.key(), "CREDIT_FAILED", &format!("{}: {}", record.tx_id, message))
                .await;
            false
        }
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub checked: usize,
    pub refreshed: usize,
    /// Deposits that could not be checked or written this cycle
    pub failed: usize,
    pub confirmed: Vec<DepositRecord>,
}

/// Promotes PENDING deposits of one chain
pub struct ConfirmationTracker {
    key: LedgerKey,
    ledger: Arc<dyn LedgerStore>,
    source: Arc<dyn ConfirmationSource>,
    sink: Arc<dyn CreditSink>,
    health: Arc<HealthRegistry>,
    threshold: u32,
    retry: RetryPolicy,
}

impl ConfirmationTracker {
    pub fn new(
        key: LedgerKey,
        ledger: Arc<dyn LedgerStore>,
        source: Arc<dyn ConfirmationSource>,
        sink: Arc<dyn CreditSink>,
        health: Arc<HealthRegistry>,
        threshold: u32,
    ) -> Self {
        Self {
            key,
            ledger,
            source,
            sink,
            health,
            threshold,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff for tip and transaction lookups
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Recompute confirmations of every pending deposit and promote those
    /// past the threshold
    ///
    /// A deposit that cannot be checked or written is recorded as a fault and
    /// left for the next cycle; the others are still processed.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let source = self.source.as_ref();
        let tip = retry_transient(&self.retry, "tip height", || source.tip_height()).await?;
        let pending = self.ledger.pending_deposits(&self.key.chain).await?;
        let mut outcome = PollOutcome::default();

        for deposit in pending {
            outcome.checked += 1;
            if let Err(e) = self.check_deposit(tip, &deposit, &mut outcome).await {
                tracing::warn!("Could not check {}: {}", deposit.tx_id, e);
                self.health
                    .record_fault(&self.key, e.error_code(), &format!("{}: {}", deposit.tx_id, e))
                    .await;
                outcome.failed += 1;
            }
        }

        Ok(outcome)
    }

    async fn check_deposit(&self, tip: u64, deposit: &DepositRecord, outcome: &mut PollOutcome) -> Result<()> {
        let source = self.source.as_ref();
        let tx_id = deposit.tx_id.as_str();
        let height = retry_transient(&self.retry, "tx status", || source.tx_block_height(tx_id)).await?;
        let confirmations = confirmations_at(tip, height);

        if confirmations > deposit.confirmations {
            self.ledger
                .refresh_confirmations(&self.key.chain, tx_id, confirmations, height.unwrap_or(0))
                .await?;
            outcome.refreshed += 1;
        }

        if height.is_none() || confirmations < self.threshold {
            return Ok(());
        }

        if let Some(record) = self.ledger.confirm_deposit(&self.key.chain, tx_id, confirmations).await? {
            tracing::info!("Deposit {} confirmed with {} confirmations", record.tx_id, confirmations);
            deliver_credit(self.sink.as_ref(), &self.health, &record).await;
            outcome.confirmed.push(record);
        }

        Ok(())
    }

    /// Poll on every tick until cancelled
    pub async fn run<T: TickSource>(&self, mut ticks: T, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                more = ticks.tick() => {
                    if !more {
                        break;
                    }
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("Confirmation poll for {} failed: {}", self.key, e);
                        self.health.record_fault(&self.key, e.error_code(), &e.to_string()).await;
                    }
                }
            }
        }
        tracing::info!("Confirmation tracker for {} stopped", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{DepositStatus, EventKind, NormalizedEvent, TxIdentifier, BITCOIN_CHAIN, BTC_ASSET};
    use crate::watcher::WatcherError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeChain {
        tip: AtomicU64,
        heights: Mutex<HashMap<String, u64>>,
        /// Tip lookups left to fail transiently
        tip_failures: AtomicUsize,
        /// Transactions the explorer cannot return
        unknown: Mutex<HashSet<String>>,
    }

    impl FakeChain {
        fn mine(&self, txid: &str, height: u64) {
            self.heights.lock().unwrap().insert(txid.to_string(), height);
        }
    }

    #[async_trait]
    impl ConfirmationSource for FakeChain {
        async fn tip_height(&self) -> WatcherResult<u64> {
            let failing = self
                .tip_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(WatcherError::Transient("esplora 503".into()));
            }
            Ok(self.tip.load(Ordering::SeqCst))
        }

        async fn tx_block_height(&self, tx_id: &str) -> WatcherResult<Option<u64>> {
            let txid = tx_id.split(':').next().unwrap_or(tx_id);
            if self.unknown.lock().unwrap().contains(txid) {
                return Err(WatcherError::Permanent(format!("/tx/{}/status not found", txid)));
            }
            Ok(self.heights.lock().unwrap().get(txid).copied())
        }
    }

    fn key() -> LedgerKey {
        LedgerKey::new(BITCOIN_CHAIN, BTC_ASSET)
    }

    fn pending(txid: &str, sats: u128) -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Deposit,
            key: key(),
            user_address: "user-1".to_string(),
            deposit_address: Some("tb1qwatched".to_string()),
            tx: TxIdentifier::bitcoin(txid, 0),
            assets_amount: sats,
            shares_amount: sats,
            timestamp: 0,
            confirmations: 0,
            status: DepositStatus::Pending,
            block_position: 0,
        }
    }

    async fn store_with_pending(sats: u128) -> MemoryStore {
        let store = MemoryStore::default();
        store.apply_batch(&key(), &[pending("aa", sats)], 0, 100).await.unwrap();
        store
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(2),
        }
    }

    fn tracker(store: &MemoryStore, chain: Arc<FakeChain>, sink: MockCreditSink) -> ConfirmationTracker {
        ConfirmationTracker::new(
            key(),
            Arc::new(store.clone()),
            chain,
            Arc::new(sink),
            Arc::new(HealthRegistry::new()),
            3,
        )
    }

    #[test]
    fn test_confirmations_at() {
        assert_eq!(confirmations_at(100, None), 0);
        assert_eq!(confirmations_at(100, Some(100)), 1);
        assert_eq!(confirmations_at(102, Some(100)), 3);
        assert_eq!(confirmations_at(99, Some(100)), 1);
    }

    #[tokio::test]
    async fn test_deposit_confirms_once_threshold_is_reached() {
        let store = store_with_pending(50_000).await;
        let chain = Arc::new(FakeChain::default());
        chain.tip.store(100, Ordering::SeqCst);

        let mut sink = MockCreditSink::new();
        sink.expect_credit()
            .withf(|notice| notice.shares_amount == 50_000 && notice.tx_id == "aa:0")
            .times(1)
            .returning(|_| Ok(()));
        let tracker = tracker(&store, chain.clone(), sink);

        // unconfirmed
        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.checked, 1);
        assert!(outcome.confirmed.is_empty());

        // one confirmation
        chain.mine("aa", 101);
        chain.tip.store(101, Ordering::SeqCst);
        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.refreshed, 1);
        assert!(outcome.confirmed.is_empty());
        let stored = store.get_deposit(BITCOIN_CHAIN, "aa:0").await.unwrap().unwrap();
        assert_eq!(stored.confirmations, 1);
        assert_eq!(stored.block_position, 101);
        assert_eq!(store.get_balance(&key(), "user-1").await.unwrap(), 0);

        chain.tip.store(103, Ordering::SeqCst);
        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.confirmed.len(), 1);
        assert_eq!(store.get_balance(&key(), "user-1").await.unwrap(), 50_000);

        // already confirmed: nothing left to check
        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.checked, 0);
    }

    #[tokio::test]
    async fn test_concurrent_polls_credit_once() {
        let store = store_with_pending(10_000).await;
        let chain = Arc::new(FakeChain::default());
        chain.mine("aa", 200);
        chain.tip.store(210, Ordering::SeqCst);

        let mut sink = MockCreditSink::new();
        sink.expect_credit().times(1).returning(|_| Ok(()));
        let tracker = Arc::new(tracker(&store, chain, sink));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.poll_once().await.unwrap().confirmed.len() })
            })
            .collect();

        let mut confirmed = 0;
        for handle in handles {
            confirmed += handle.await.unwrap();
        }
        assert_eq!(confirmed, 1);
        assert_eq!(store.get_balance(&key(), "user-1").await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_failed_credit_is_recorded_not_retried() {
        let store = store_with_pending(5_000).await;
        let chain = Arc::new(FakeChain::default());
        chain.mine("aa", 10);
        chain.tip.store(20, Ordering::SeqCst);

        let mut sink = MockCreditSink::new();
        sink.expect_credit()
            .times(1)
            .returning(|_| Err(CreditError::Rejected("400".into())));
        let health = Arc::new(HealthRegistry::new());
        let tracker = ConfirmationTracker::new(
            key(),
            Arc::new(store.clone()),
            chain,
            Arc::new(sink),
            health.clone(),
            3,
        );

        tracker.poll_once().await.unwrap();
        tracker.poll_once().await.unwrap();

        let faults = health.faults().await;
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, "CREDIT_FAILED");
    }

    #[tokio::test]
    async fn test_transient_tip_errors_are_retried() {
        let store = store_with_pending(7_000).await;
        let chain = Arc::new(FakeChain::default());
        chain.mine("aa", 50);
        chain.tip.store(60, Ordering::SeqCst);
        chain.tip_failures.store(2, Ordering::SeqCst);

        let mut sink = MockCreditSink::new();
        sink.expect_credit().times(1).returning(|_| Ok(()));
        let tracker = tracker(&store, chain.clone(), sink).with_retry(fast_retry());

        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.confirmed.len(), 1);
        assert_eq!(chain.tip_failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_unreadable_deposit_does_not_block_the_rest() {
        let store = MemoryStore::default();
        store
            .apply_batch(&key(), &[pending("aa", 1_000), pending("bb", 2_000)], 0, 100)
            .await
            .unwrap();
        let chain = Arc::new(FakeChain::default());
        chain.mine("bb", 90);
        chain.tip.store(100, Ordering::SeqCst);
        chain.unknown.lock().unwrap().insert("aa".to_string());

        let mut sink = MockCreditSink::new();
        sink.expect_credit()
            .withf(|notice| notice.tx_id == "bb:0")
            .times(1)
            .returning(|_| Ok(()));
        let health = Arc::new(HealthRegistry::new());
        let tracker = ConfirmationTracker::new(
            key(),
            Arc::new(store.clone()),
            chain,
            Arc::new(sink),
            health.clone(),
            3,
        )
        .with_retry(fast_retry());

        let outcome = tracker.poll_once().await.unwrap();
        assert_eq!(outcome.checked, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.confirmed.len(), 1);
        assert_eq!(store.get_balance(&key(), "user-1").await.unwrap(), 2_000);

        let faults = health.faults().await;
        assert_eq!(faults.len(), 1);
        assert!(faults[0].message.starts_with("aa:0"));
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_notice() {
        use axum::routing::post;
        use axum::{Json, Router};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let app = Router::new().route(
            "/credits",
            post(move |Json(notice): Json<CreditNotice>| {
                let tx = tx.clone();
                async move {
                    tx.send(notice).unwrap();
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink = WebhookCreditSink::new(
            &format!("http://{}/credits", addr),
            Duration::from_secs(5),
            RetryPolicy::new(Duration::from_secs(5)),
        );
        let notice = CreditNotice {
            chain: BITCOIN_CHAIN.to_string(),
            asset: BTC_ASSET.to_string(),
            user_address: "user-1".to_string(),
            deposit_address: Some("tb1qwatched".to_string()),
            tx_id: "aa:0".to_string(),
            assets_amount: 50_000,
            shares_amount: 50_000,
            confirmations: 3,
        };

        sink.credit(&notice).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), notice);
    }
}
