//! Live Subscription
//!
//! Long-lived poller for one pair. Every tick re-reads the durable cursor and
//! fetches from `cursor + 1 - overlap`, so events at the edge of the last
//! poll are seen again rather than missed; the ledger drops the repeats.
//! Watchers that rescan everything per fetch (`chunk_size() == u64::MAX`)
//! are polled even when no new position has appeared, since their unit of
//! work is the set of watched addresses rather than a block range.
//! After a provider failure the next attempt waits on an exponential
//! backoff, which resets on the first successful poll.

use std::sync::Arc;

use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;

use super::{walk_range, Ingestor, WalkProgress};
use crate::common::Result;
use crate::health::HealthRegistry;
use crate::storage::CursorStore;
use crate::ticks::TickSource;
use crate::watcher::{ChainWatcher, RetryPolicy};

/// Tick-driven poller for one (chain, asset) pair
pub struct LiveSubscription {
    watcher: Arc<dyn ChainWatcher>,
    ingestor: Arc<Ingestor>,
    cursors: Arc<dyn CursorStore>,
    health: Arc<HealthRegistry>,
    reconnect: RetryPolicy,
}

impl LiveSubscription {
    pub fn new(
        watcher: Arc<dyn ChainWatcher>,
        ingestor: Arc<Ingestor>,
        cursors: Arc<dyn CursorStore>,
        health: Arc<HealthRegistry>,
        reconnect: RetryPolicy,
    ) -> Self {
        Self {
            watcher,
            ingestor,
            cursors,
            health,
            reconnect,
        }
    }

    /// One poll: re-fetch the overlap window and everything new
    pub async fn poll_once(&self) -> Result<WalkProgress> {
        let key = self.watcher.key();
        let genesis = self.watcher.genesis();
        let latest = self.watcher.latest_position().await?;
        let cursor = self.cursors.get_cursor(&key, genesis).await?;

        let mut from = (cursor + 1)
            .saturating_sub(self.watcher.live_overlap())
            .max(genesis + 1);
        if self.watcher.chunk_size() == u64::MAX && latest > genesis {
            from = from.min(latest);
        }
        if from > latest {
            self.health.record_progress(&key, cursor, latest).await;
            return Ok(WalkProgress {
                reached: cursor,
                ..Default::default()
            });
        }

        let progress = walk_range(self.watcher.as_ref(), &self.ingestor, from, latest).await?;
        self.health
            .record_progress(&key, progress.reached.max(cursor), latest)
            .await;
        Ok(progress)
    }

    /// Poll on every tick until cancelled or the tick source ends
    pub async fn run<T: TickSource>(&self, mut ticks: T, cancel: CancellationToken) {
        let key = self.watcher.key();
        let mut backoff = self.reconnect.backoff();
        tracing::info!("Live subscription for {} started", key);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                more = ticks.tick() => {
                    if !more {
                        break;
                    }
                }
            }

            match self.poll_once().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    self.health.record_failure(&key, &e.to_string()).await;
                    let delay = backoff.next_backoff().unwrap_or(self.reconnect.max_interval);
                    tracing::warn!("Live poll for {} failed: {}; reconnecting in {:?}", key, e, delay);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Live subscription for {} stopped", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::MockCreditSink;
    use crate::storage::{LedgerStore, MemoryStore};
    use crate::ticks::manual;
    use crate::types::{DepositStatus, EventKind, LedgerKey, NormalizedEvent, TxIdentifier};
    use crate::watcher::{FetchedRange, MockChainWatcher, WatcherError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn key() -> LedgerKey {
        LedgerKey::new("base", "USDC")
    }

    fn deposit(hash: &str, index: u64, position: u64) -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Deposit,
            key: key(),
            user_address: "0xuser".to_string(),
            deposit_address: None,
            tx: TxIdentifier::evm(hash, index),
            assets_amount: 10,
            shares_amount: 10,
            timestamp: 0,
            confirmations: 12,
            status: DepositStatus::Confirmed,
            block_position: position,
        }
    }

    fn fast_reconnect() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(5),
        }
    }

    fn subscription(store: &MemoryStore, watcher: MockChainWatcher) -> (LiveSubscription, Arc<HealthRegistry>) {
        let health = Arc::new(HealthRegistry::new());
        let mut sink = MockCreditSink::new();
        sink.expect_credit().returning(|_| Ok(()));
        let ingestor = Arc::new(Ingestor::new(
            key(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(sink),
            health.clone(),
        ));
        let live = LiveSubscription::new(
            Arc::new(watcher),
            ingestor,
            Arc::new(store.clone()),
            health.clone(),
            fast_reconnect(),
        );
        (live, health)
    }

    #[tokio::test]
    async fn test_poll_refetches_overlap_window() {
        let store = MemoryStore::default();
        store.apply_batch(&key(), &[], 1, 200).await.unwrap();
        store.set_cursor(&key(), 200).await.unwrap();

        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(0u64);
        watcher.expect_chunk_size().return_const(1_000u64);
        watcher.expect_live_overlap().return_const(5u64);
        watcher.expect_latest_position().returning(|| Ok(210));
        watcher.expect_fetch_historical_range().returning(move |from, to| {
            seen.lock().unwrap().push((from, to));
            Ok(FetchedRange::new(vec![deposit("0xedge", 0, 198), deposit("0xnew", 1, 205)]))
        });
        let (live, _) = subscription(&store, watcher);

        live.poll_once().await.unwrap();
        live.poll_once().await.unwrap();

        assert_eq!(*ranges.lock().unwrap(), vec![(196, 210), (206, 210)]);
        assert_eq!(store.get_cursor(&key(), 0).await.unwrap(), 210);
        // both polls delivered the same two events
        assert_eq!(store.get_balance(&key(), "0xuser").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_rescanning_watcher_is_polled_at_the_tip() {
        let store = MemoryStore::default();
        store.apply_batch(&key(), &[], 1, 120).await.unwrap();
        store.set_cursor(&key(), 120).await.unwrap();

        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(0u64);
        watcher.expect_chunk_size().return_const(u64::MAX);
        watcher.expect_live_overlap().return_const(0u64);
        watcher.expect_latest_position().returning(|| Ok(120));
        watcher.expect_fetch_historical_range().returning(move |from, to| {
            seen.lock().unwrap().push((from, to));
            Ok(FetchedRange::new(vec![deposit("0xmempool", 0, 0)]))
        });
        let (live, _) = subscription(&store, watcher);

        live.poll_once().await.unwrap();

        assert_eq!(*ranges.lock().unwrap(), vec![(120, 120)]);
        assert_eq!(store.get_cursor(&key(), 0).await.unwrap(), 120);
        assert_eq!(store.get_balance(&key(), "0xuser").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_ranged_watcher_idles_at_the_tip() {
        let store = MemoryStore::default();
        store.apply_batch(&key(), &[], 1, 120).await.unwrap();
        store.set_cursor(&key(), 120).await.unwrap();

        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(0u64);
        watcher.expect_chunk_size().return_const(1_000u64);
        watcher.expect_live_overlap().return_const(0u64);
        watcher.expect_latest_position().returning(|| Ok(120));
        watcher.expect_fetch_historical_range().never();
        let (live, _) = subscription(&store, watcher);

        let progress = live.poll_once().await.unwrap();
        assert_eq!(progress.reached, 120);
        assert_eq!(progress.chunks, 0);
    }

    #[tokio::test]
    async fn test_run_recovers_after_provider_failure() {
        let store = MemoryStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        watcher.expect_genesis().return_const(0u64);
        watcher.expect_chunk_size().return_const(1_000u64);
        watcher.expect_live_overlap().return_const(0u64);
        watcher.expect_latest_position().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(WatcherError::Transient("connection reset".into()))
            } else {
                Ok(50)
            }
        });
        watcher
            .expect_fetch_historical_range()
            .returning(|_, _| Ok(FetchedRange::default()));
        let (live, health) = subscription(&store, watcher);

        let (handle, ticks) = manual();
        handle.tick();
        handle.tick();
        drop(handle);
        live.run(ticks, CancellationToken::new()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_cursor(&key(), 0).await.unwrap(), 50);
        let pair = health.pair(&key()).await.unwrap();
        assert_eq!(pair.consecutive_failures, 0);
        assert_eq!(pair.cursor, Some(50));
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let store = MemoryStore::default();
        let mut watcher = MockChainWatcher::new();
        watcher.expect_key().returning(key);
        let (live, _) = subscription(&store, watcher);

        let (_handle, ticks) = manual();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), live.run(ticks, cancel))
            .await
            .unwrap();
    }
}
