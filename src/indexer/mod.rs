//! Ingestion Pipeline
//!
//! Chain-agnostic path from a `ChainWatcher` into the ledger:
//! - `ingest` - persist one fetched range, then advance the cursor
//! - `backfill` - resumable catch-up from the stored cursor to the chain's final position
//! - `live` - tick-driven polling with an overlap window and reconnect backoff

pub mod backfill;
pub mod ingest;
pub mod live;

pub use backfill::{Backfill, BackfillReport};
pub use ingest::{IngestOutcome, Ingestor};
pub use live::LiveSubscription;

use crate::common::Result;
use crate::watcher::ChainWatcher;

/// Progress of a chunked walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkProgress {
    /// Last position persisted and covered by the cursor
    pub reached: u64,
    pub chunks: usize,
    pub events: usize,
}

/// Fetch and ingest `[from, to]` in `chunk_size` steps
///
/// Each chunk is persisted and the cursor advanced before the next chunk is
/// fetched; on error the cursor stays at the end of the last good chunk.
pub async fn walk_range(watcher: &dyn ChainWatcher, ingestor: &Ingestor, from: u64, to: u64) -> Result<WalkProgress> {
    let chunk_size = watcher.chunk_size().max(1);
    let mut progress = WalkProgress {
        reached: from.saturating_sub(1),
        ..Default::default()
    };

    let mut start = from;
    while start <= to {
        let end = start.saturating_add(chunk_size - 1).min(to);

        let range = watcher.fetch_historical_range(start, end).await?;
        progress.events += range.events.len();
        ingestor.ingest(start, end, range).await?;

        progress.reached = end;
        progress.chunks += 1;

        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }

    Ok(progress)
}
