//! Range Ingestion
//!
//! Persists one fetched range for a (chain, asset) pair in write-ahead
//! order: records and watermark first (`apply_batch`), cursor second,
//! side effects last.

use std::sync::Arc;
use std::time::Instant;

use crate::common::{log_ingest_event, Result};
use crate::confirmation::{deliver_credit, CreditSink};
use crate::health::HealthRegistry;
use crate::storage::{CursorStore, LedgerStore};
use crate::types::LedgerKey;
use crate::watcher::FetchedRange;

/// What one `ingest` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub faults: usize,
    pub skipped: usize,
    pub credited: usize,
}

/// Writes fetched ranges of one pair into the ledger
pub struct Ingestor {
    key: LedgerKey,
    ledger: Arc<dyn LedgerStore>,
    cursors: Arc<dyn CursorStore>,
    sink: Arc<dyn CreditSink>,
    health: Arc<HealthRegistry>,
}

impl Ingestor {
    pub fn new(
        key: LedgerKey,
        ledger: Arc<dyn LedgerStore>,
        cursors: Arc<dyn CursorStore>,
        sink: Arc<dyn CreditSink>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            key,
            ledger,
            cursors,
            sink,
            health,
        }
    }

    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    /// Persist `range` as covering `[from, through]` and advance the cursor
    ///
    /// Deposits first inserted as CONFIRMED are credited after the cursor
    /// moves; withdrawals that would overdraw a balance are recorded as
    /// faults and left out.
    pub async fn ingest(&self, from: u64, through: u64, range: FetchedRange) -> Result<IngestOutcome> {
        let started = Instant::now();
        let key = self.key.to_string();

        for unit in &range.skipped {
            self.health
                .record_fault(&self.key, "MALFORMED_EVENT", &format!("skipped {}: {}", unit.unit, unit.reason))
                .await;
        }

        let batch = self.ledger.apply_batch(&self.key, &range.events, from, through).await?;
        self.cursors.set_cursor(&self.key, through).await?;

        for fault in &batch.faults {
            self.health
                .record_fault(
                    &self.key,
                    "LEDGER_CONSISTENCY_FAULT",
                    &format!("{} ({}): {}", fault.tx_id, fault.user_address, fault.message),
                )
                .await;
        }

        let mut credited = 0;
        for record in batch.confirmed_first_inserts() {
            if deliver_credit(self.sink.as_ref(), &self.health, record).await {
                credited += 1;
            }
        }

        let outcome = IngestOutcome {
            inserted: batch.inserted(),
            updated: batch.updated,
            duplicates: batch.duplicates,
            faults: batch.faults.len(),
            skipped: range.skipped.len(),
            credited,
        };

        log_ingest_event(
            &key,
            from,
            through,
            outcome.inserted,
            outcome.duplicates,
            started.elapsed().as_millis() as u64,
        );

        Ok(outcome)
    }
}
