//! Historical Backfill
//!
//! Walks `[cursor + 1, latest]` for one pair. A crash or provider failure
//! mid-walk leaves the cursor at the last fully persisted chunk; the next run
//! resumes there and replays at most one chunk, which the ledger absorbs
//! idempotently.

use std::sync::Arc;

use super::{walk_range, Ingestor};
use crate::common::Result;
use crate::health::HealthRegistry;
use crate::storage::CursorStore;
use crate::watcher::ChainWatcher;

/// Summary of one backfill run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub start_cursor: u64,
    pub cursor: u64,
    pub latest: u64,
    pub chunks: usize,
    pub events: usize,
}

/// Resumable catch-up for one (chain, asset) pair
pub struct Backfill {
    watcher: Arc<dyn ChainWatcher>,
    ingestor: Arc<Ingestor>,
    cursors: Arc<dyn CursorStore>,
    health: Arc<HealthRegistry>,
}

impl Backfill {
    pub fn new(
        watcher: Arc<dyn ChainWatcher>,
        ingestor: Arc<Ingestor>,
        cursors: Arc<dyn CursorStore>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            watcher,
            ingestor,
            cursors,
            health,
        }
    }

    /// Catch up from the stored cursor to the watcher's latest final position
    pub async fn run_once(&self) -> Result<BackfillReport> {
        let key = self.watcher.key();
        match self.catch_up().await {
            Ok(report) => {
                self.health.record_progress(&key, report.cursor, report.latest).await;
                if report.chunks > 0 {
                    tracing::info!(
                        "Backfill of {} reached {} ({} chunks, {} events)",
                        key,
                        report.cursor,
                        report.chunks,
                        report.events
                    );
                }
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Backfill of {} stopped: {}", key, e);
                self.health.record_failure(&key, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn catch_up(&self) -> Result<BackfillReport> {
        let key = self.watcher.key();
        let latest = self.watcher.latest_position().await?;
        let start_cursor = self.cursors.get_cursor(&key, self.watcher.genesis()).await?;

        let mut report = BackfillReport {
            start_cursor,
            cursor: start_cursor,
            latest,
            chunks: 0,
            events: 0,
        };
        if start_cursor >= latest {
            return Ok(report);
        }

        let progress = walk_range(self.watcher.as_ref(), &self.ingestor, start_cursor + 1, latest).await?;
        report.cursor = progress.reached;
        report.chunks = progress.chunks;
        report.events = progress.events;
        Ok(report)
    }
}
