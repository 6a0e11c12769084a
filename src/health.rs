//! Health Registry
//!
//! Per (chain, asset) progress, failures and faults, shared by the ingestion
//! tasks, the reconciler and the API.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::common::log_fault;
use crate::reconciler::ReconciliationReport;
use crate::types::LedgerKey;

/// Faults kept in memory
pub const MAX_FAULTS: usize = 200;

/// Consecutive failed passes after which a pair is reported degraded
pub const DEGRADED_AFTER: u32 = 3;

/// A recorded fault
#[derive(Debug, Clone, Serialize)]
pub struct FaultRecord {
    pub ledger_key: String,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Status of one (chain, asset) pair
#[derive(Debug, Clone, Serialize)]
pub struct PairHealth {
    pub chain: String,
    pub asset: String,
    pub cursor: Option<u64>,
    pub latest_position: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_reconciliation: Option<ReconciliationReport>,
}

impl PairHealth {
    fn new(key: &LedgerKey) -> Self {
        Self {
            chain: key.chain.clone(),
            asset: key.asset.clone(),
            cursor: None,
            latest_position: None,
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
            last_reconciliation: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= DEGRADED_AFTER
    }

    /// Positions between the cursor and the chain's latest final position
    pub fn lag(&self) -> Option<u64> {
        match (self.cursor, self.latest_position) {
            (Some(cursor), Some(latest)) => Some(latest.saturating_sub(cursor)),
            _ => None,
        }
    }
}

/// Point-in-time view of the registry
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub pairs: Vec<PairHealth>,
    pub faults: Vec<FaultRecord>,
}

#[derive(Debug)]
struct HealthState {
    pairs: BTreeMap<LedgerKey, PairHealth>,
    faults: VecDeque<FaultRecord>,
}

/// Shared health/status registry
#[derive(Debug)]
pub struct HealthRegistry {
    started_at: DateTime<Utc>,
    state: RwLock<HealthState>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            state: RwLock::new(HealthState {
                pairs: BTreeMap::new(),
                faults: VecDeque::new(),
            }),
        }
    }

    /// Make a pair visible before its first pass
    pub async fn register(&self, key: &LedgerKey) {
        let mut state = self.state.write().await;
        state.pairs.entry(key.clone()).or_insert_with(|| PairHealth::new(key));
    }

    /// A pass that reached `cursor` with the chain at `latest`
    pub async fn record_progress(&self, key: &LedgerKey, cursor: u64, latest: u64) {
        let mut state = self.state.write().await;
        let pair = state.pairs.entry(key.clone()).or_insert_with(|| PairHealth::new(key));
        pair.cursor = Some(cursor);
        pair.latest_position = Some(latest);
        pair.last_success = Some(Utc::now());
        pair.consecutive_failures = 0;
        pair.last_error = None;
    }

    /// A pass that failed as a whole
    pub async fn record_failure(&self, key: &LedgerKey, error: &str) {
        let mut state = self.state.write().await;
        let pair = state.pairs.entry(key.clone()).or_insert_with(|| PairHealth::new(key));
        pair.consecutive_failures = pair.consecutive_failures.saturating_add(1);
        pair.last_error = Some(error.to_string());
    }

    /// Record and log a fault
    pub async fn record_fault(&self, key: &LedgerKey, code: &str, message: &str) {
        log_fault(&key.to_string(), code, message);

        let mut state = self.state.write().await;
        if state.faults.len() >= MAX_FAULTS {
            state.faults.pop_front();
        }
        state.faults.push_back(FaultRecord {
            ledger_key: key.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    pub async fn record_report(&self, report: &ReconciliationReport) {
        let key = report.key();
        let mut state = self.state.write().await;
        let pair = state.pairs.entry(key.clone()).or_insert_with(|| PairHealth::new(&key));
        pair.last_reconciliation = Some(report.clone());
    }

    pub async fn pair(&self, key: &LedgerKey) -> Option<PairHealth> {
        self.state.read().await.pairs.get(key).cloned()
    }

    pub async fn faults(&self) -> Vec<FaultRecord> {
        self.state.read().await.faults.iter().cloned().collect()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read().await;
        let pairs: Vec<PairHealth> = state.pairs.values().cloned().collect();
        let status = if pairs.iter().any(PairHealth::is_degraded) {
            "degraded"
        } else {
            "healthy"
        };

        HealthSnapshot {
            status,
            started_at: self.started_at,
            pairs,
            faults: state.faults.iter().cloned().collect(),
        }
    }
}
