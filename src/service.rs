//! Indexer Service
//!
//! Builds the stores, watchers and periodic tasks described by an
//! `IndexerConfig` and runs them as independent tokio tasks:
//! - per (chain, asset): one backfill pass, then the live subscription
//! - Bitcoin: the confirmation tracker
//! - the scheduled reconciler
//! - the HTTP API
//!
//! Every task shares one `CancellationToken`; cancelling it stops scheduling
//! new work and lets in-flight writes finish.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{start_server, ApiState, SharedApiState};
use crate::common::{IndexerConfig, Result};
use crate::confirmation::{ConfirmationTracker, CreditSink, LoggingCreditSink, WebhookCreditSink};
use crate::health::HealthRegistry;
use crate::indexer::{Backfill, Ingestor, LiveSubscription};
use crate::reconciler::Reconciler;
use crate::storage::{BindingStore, CursorStore, LedgerStore, SqliteStore};
use crate::ticks::IntervalTicks;
use crate::types::units::amount_string;
use crate::types::{LedgerKey, BITCOIN_CHAIN, BTC_ASSET};
use crate::watcher::{evm, solana, BitcoinWatcher, ChainWatcher, EsploraClient, EvmWatcher, RetryPolicy, SolanaWatcher};

/// The three store roles, usually backed by one database
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub bindings: Arc<dyn BindingStore>,
}

impl Stores {
    pub fn from_store<S>(store: S) -> Self
    where
        S: LedgerStore + CursorStore + BindingStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            ledger: store.clone(),
            cursors: store.clone(),
            bindings: store,
        }
    }

    /// SQLite at `db_path`; `:memory:` opens a private in-memory database
    pub fn open(db_path: &str) -> Result<Self> {
        let store = if db_path == ":memory:" {
            SqliteStore::in_memory()?
        } else {
            SqliteStore::new(db_path)?
        };
        Ok(Self::from_store(store))
    }
}

/// Durable state of one pair, read without running any watcher
#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub chain: String,
    pub asset: String,
    pub cursor: u64,
    pub persisted_through: Option<u64>,
    #[serde(with = "amount_string")]
    pub total_shares: u128,
}

/// Everything the indexer runs, wired together
pub struct IndexerService {
    config: IndexerConfig,
    stores: Stores,
    health: Arc<HealthRegistry>,
    sink: Arc<dyn CreditSink>,
    watchers: Vec<Arc<dyn ChainWatcher>>,
    esplora: Option<EsploraClient>,
    reconciler: Arc<Reconciler>,
}

impl IndexerService {
    /// Open the database and build every configured watcher
    pub fn from_config(config: IndexerConfig) -> Result<Self> {
        let stores = Stores::open(&config.db_path)?;
        let retry = RetryPolicy::new(config.retry_max_elapsed());
        let timeout = config.rpc_timeout();

        let mut watchers: Vec<Arc<dyn ChainWatcher>> = Vec::new();

        for chain in &config.evm_chains {
            let provider = evm::connect(&chain.rpc_url, timeout)?;
            for vault in &chain.vaults {
                let watcher = EvmWatcher::new(
                    provider.clone(),
                    LedgerKey::new(&chain.name, &vault.asset),
                    &vault.address,
                    vault.genesis,
                    chain.chunk_size,
                    chain.finality_depth,
                    config.live_overlap,
                    retry,
                )?;
                watchers.push(Arc::new(watcher));
            }
        }

        if let Some(sol) = &config.solana {
            let rpc = solana::connect(&sol.rpc_url, timeout);
            for asset in &sol.assets {
                let watcher = SolanaWatcher::new(
                    rpc.clone(),
                    &asset.asset,
                    &sol.program_id,
                    &asset.address,
                    asset.genesis,
                    sol.chunk_size,
                    config.live_overlap,
                    retry,
                )?;
                watchers.push(Arc::new(watcher));
            }
        }

        let esplora = if config.bitcoin.enabled {
            let client = EsploraClient::new(&config.bitcoin.api_url, timeout);
            watchers.push(Arc::new(BitcoinWatcher::new(
                client.clone(),
                stores.bindings.clone(),
                config.bitcoin.genesis,
                config.bitcoin.confirmations_required,
                config.live_overlap,
                retry,
            )));
            Some(client)
        } else {
            None
        };

        let sink: Arc<dyn CreditSink> = match &config.credit_webhook_url {
            Some(url) => Arc::new(WebhookCreditSink::new(url, timeout, retry)),
            None => Arc::new(LoggingCreditSink),
        };

        Ok(Self::with_parts(config, stores, watchers, sink, esplora))
    }

    /// Assemble a service from prebuilt parts
    pub fn with_parts(
        config: IndexerConfig,
        stores: Stores,
        watchers: Vec<Arc<dyn ChainWatcher>>,
        sink: Arc<dyn CreditSink>,
        esplora: Option<EsploraClient>,
    ) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let reconciler = Arc::new(Reconciler::new(
            stores.ledger.clone(),
            stores.cursors.clone(),
            watchers.clone(),
            health.clone(),
            config.reconcile_tolerance,
        ));

        Self {
            config,
            stores,
            health,
            sink,
            watchers,
            esplora,
            reconciler,
        }
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn watchers(&self) -> &[Arc<dyn ChainWatcher>] {
        &self.watchers
    }

    pub fn api_state(&self) -> SharedApiState {
        Arc::new(ApiState::new(
            self.stores.ledger.clone(),
            self.stores.bindings.clone(),
            self.reconciler.clone(),
            self.health.clone(),
            self.config.network.bitcoin_network(),
        ))
    }

    /// Cursor, watermark and ledger total of every configured pair
    pub async fn pair_status(&self) -> Result<Vec<PairStatus>> {
        let stored = self.stores.cursors.cursors().await?;
        let mut out = Vec::with_capacity(self.watchers.len());

        for watcher in &self.watchers {
            let key = watcher.key();
            let persisted_through = stored
                .iter()
                .find(|c| c.key == key)
                .and_then(|c| c.persisted_through);
            out.push(PairStatus {
                cursor: self.stores.cursors.get_cursor(&key, watcher.genesis()).await?,
                persisted_through,
                total_shares: self.stores.ledger.total_shares(&key).await?,
                chain: key.chain,
                asset: key.asset,
            });
        }

        Ok(out)
    }

    fn ingestor(&self, key: LedgerKey) -> Arc<Ingestor> {
        Arc::new(Ingestor::new(
            key,
            self.stores.ledger.clone(),
            self.stores.cursors.clone(),
            self.sink.clone(),
            self.health.clone(),
        ))
    }

    /// Run every task until `cancel` fires
    ///
    /// A failure to bind the API port cancels the whole service.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        let reconnect = RetryPolicy::new(self.config.retry_max_elapsed());
        let live_period = Duration::from_secs(self.config.live_poll_secs);

        for watcher in &self.watchers {
            let key = watcher.key();
            self.health.register(&key).await;

            let ingestor = self.ingestor(key.clone());
            let backfill = Backfill::new(
                watcher.clone(),
                ingestor.clone(),
                self.stores.cursors.clone(),
                self.health.clone(),
            );
            let live = LiveSubscription::new(
                watcher.clone(),
                ingestor,
                self.stores.cursors.clone(),
                self.health.clone(),
                reconnect,
            );
            let cancel = cancel.clone();

            tasks.spawn(async move {
                tracing::info!("Starting {} from stored cursor", key);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    // a failed pass is resumed by the live subscription
                    _ = backfill.run_once() => {}
                }
                live.run(IntervalTicks::new(live_period), cancel).await;
            });
        }

        if let Some(esplora) = &self.esplora {
            let tracker = ConfirmationTracker::new(
                LedgerKey::new(BITCOIN_CHAIN, BTC_ASSET),
                self.stores.ledger.clone(),
                Arc::new(esplora.clone()),
                self.sink.clone(),
                self.health.clone(),
                self.config.bitcoin.confirmations_required,
            )
            .with_retry(reconnect);
            let ticks = IntervalTicks::new(Duration::from_secs(self.config.confirmation_poll_secs));
            let cancel = cancel.clone();
            tasks.spawn(async move { tracker.run(ticks, cancel).await });
        }

        {
            let reconciler = self.reconciler.clone();
            let ticks = IntervalTicks::after_first_period(Duration::from_secs(self.config.reconcile_interval_secs));
            let cancel = cancel.clone();
            tasks.spawn(async move { reconciler.run(ticks, cancel).await });
        }

        {
            let state = self.api_state();
            let port = self.config.api_port;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = start_server(state, port, cancel.clone()).await {
                    tracing::error!("API server on port {} failed: {}", port, e);
                    cancel.cancel();
                }
            });
        }

        tracing::info!("Indexer running {} watcher(s)", self.watchers.len());
        cancel.cancelled().await;
        tracing::info!("Shutting down");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Task ended abnormally: {}", e);
            }
        }

        Ok(())
    }
}
