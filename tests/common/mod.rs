//! Shared fixtures for the scenario tests: a scripted in-memory chain, a
//! recording credit sink and pipeline builders.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nexxore_indexer::confirmation::{CreditError, CreditNotice, CreditSink};
use nexxore_indexer::indexer::{Backfill, Ingestor, LiveSubscription};
use nexxore_indexer::watcher::{ChainWatcher, FetchedRange, RetryPolicy, WatcherError, WatcherResult};
use nexxore_indexer::{ChainFamily, DepositStatus, EventKind, HealthRegistry, LedgerKey, MemoryStore, NormalizedEvent, TxIdentifier};

pub fn usdc() -> LedgerKey {
    LedgerKey::new("ethereum", "USDC")
}

pub fn evm_event(kind: EventKind, hash: &str, log_index: u64, user: &str, shares: u128, position: u64) -> NormalizedEvent {
    NormalizedEvent {
        kind,
        key: usdc(),
        user_address: user.to_string(),
        deposit_address: None,
        tx: TxIdentifier::evm(hash, log_index),
        assets_amount: shares,
        shares_amount: shares,
        timestamp: 1_700_000_000 + position as i64,
        confirmations: 12,
        status: DepositStatus::Confirmed,
        block_position: position,
    }
}

pub fn deposit(hash: &str, log_index: u64, user: &str, shares: u128, position: u64) -> NormalizedEvent {
    evm_event(EventKind::Deposit, hash, log_index, user, shares, position)
}

pub fn withdrawal(hash: &str, log_index: u64, user: &str, shares: u128, position: u64) -> NormalizedEvent {
    evm_event(EventKind::Withdrawal, hash, log_index, user, shares, position)
}

#[derive(Default)]
struct ChainState {
    events: Vec<NormalizedEvent>,
    hidden: HashSet<String>,
    latest: u64,
    fail_from: Option<u64>,
    fetches: Vec<(u64, u64)>,
}

/// In-memory chain whose history, tip and failures are set by the test
pub struct ScriptedWatcher {
    key: LedgerKey,
    genesis: u64,
    chunk_size: u64,
    live_overlap: u64,
    state: Mutex<ChainState>,
}

impl ScriptedWatcher {
    pub fn new(key: LedgerKey, genesis: u64, chunk_size: u64, live_overlap: u64) -> Self {
        Self {
            key,
            genesis,
            chunk_size,
            live_overlap,
            state: Mutex::new(ChainState {
                latest: genesis,
                ..Default::default()
            }),
        }
    }

    pub fn push(&self, event: NormalizedEvent) {
        let mut state = self.state.lock().unwrap();
        state.latest = state.latest.max(event.block_position);
        state.events.push(event);
    }

    pub fn set_latest(&self, latest: u64) {
        self.state.lock().unwrap().latest = latest;
    }

    /// Keep an event on chain but out of every fetched range
    pub fn hide(&self, tx: &TxIdentifier) {
        self.state.lock().unwrap().hidden.insert(tx.canonical());
    }

    pub fn reveal(&self, tx: &TxIdentifier) {
        self.state.lock().unwrap().hidden.remove(&tx.canonical());
    }

    /// Fail every fetch whose range contains `position`
    pub fn fail_at(&self, position: Option<u64>) {
        self.state.lock().unwrap().fail_from = position;
    }

    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl ChainWatcher for ScriptedWatcher {
    fn key(&self) -> LedgerKey {
        self.key.clone()
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn genesis(&self) -> u64 {
        self.genesis
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn live_overlap(&self) -> u64 {
        self.live_overlap
    }

    async fn latest_position(&self) -> WatcherResult<u64> {
        Ok(self.state.lock().unwrap().latest)
    }

    async fn fetch_historical_range(&self, from: u64, to: u64) -> WatcherResult<FetchedRange> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push((from, to));

        if let Some(position) = state.fail_from {
            if from <= position && position <= to {
                return Err(WatcherError::Transient(format!("provider dropped range {}-{}", from, to)));
            }
        }

        let events = state
            .events
            .iter()
            .filter(|e| from <= e.block_position && e.block_position <= to)
            .filter(|e| !state.hidden.contains(&e.tx.canonical()))
            .cloned()
            .collect();
        Ok(FetchedRange::new(events))
    }

    async fn authoritative_total_shares(&self, at: u64) -> WatcherResult<u128> {
        let state = self.state.lock().unwrap();
        let mut total: i128 = 0;
        for event in state.events.iter().filter(|e| e.block_position <= at) {
            match event.kind {
                EventKind::Deposit => total += event.shares_amount as i128,
                EventKind::Withdrawal => total -= event.shares_amount as i128,
            }
        }
        Ok(total.max(0) as u128)
    }
}

/// Credit sink that remembers every notice
#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<CreditNotice>>,
}

impl RecordingSink {
    pub fn notices(&self) -> Vec<CreditNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl CreditSink for RecordingSink {
    async fn credit(&self, notice: &CreditNotice) -> Result<(), CreditError> {
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Backfill and live subscription of one pair, sharing one ingestor
pub struct Pipeline {
    pub ingestor: Arc<Ingestor>,
    pub backfill: Backfill,
    pub live: LiveSubscription,
    pub health: Arc<HealthRegistry>,
}

pub fn pipeline(store: &MemoryStore, watcher: Arc<dyn ChainWatcher>, sink: Arc<dyn CreditSink>) -> Pipeline {
    let health = Arc::new(HealthRegistry::new());
    let ingestor = Arc::new(Ingestor::new(
        watcher.key(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        sink,
        health.clone(),
    ));
    let backfill = Backfill::new(watcher.clone(), ingestor.clone(), Arc::new(store.clone()), health.clone());
    let live = LiveSubscription::new(
        watcher,
        ingestor.clone(),
        Arc::new(store.clone()),
        health.clone(),
        fast_retry(),
    );

    Pipeline {
        ingestor,
        backfill,
        live,
        health,
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        max_elapsed: Duration::from_millis(200),
    }
}
