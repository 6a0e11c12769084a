//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and dry runs.
//! Data is lost when the service restarts.
//!
//! All state sits behind one lock so that every trait call is atomic, the
//! same guarantee the SQLite store gets from its transactions.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{
    apply_delta, next_watermark, to_delta, BatchOutcome, BindingStore, CursorState, CursorStore,
    LedgerFault, LedgerStore, StorageError, StorageResult,
};
use crate::types::{
    AddressBinding, DepositRecord, DepositStatus, EventKind, LedgerKey, NormalizedEvent, ShareBalance,
    WithdrawalRecord,
};

#[derive(Debug, Default, Clone, Copy)]
struct CursorRow {
    position: Option<u64>,
    persisted_through: Option<u64>,
}

/// (chain, tx_id)
type RecordId = (String, String);

#[derive(Debug, Default, Clone)]
struct MemoryState {
    deposits: BTreeMap<RecordId, DepositRecord>,
    withdrawals: BTreeMap<RecordId, WithdrawalRecord>,
    /// (chain, asset, user) -> shares
    balances: BTreeMap<(String, String, String), u128>,
    cursors: HashMap<LedgerKey, CursorRow>,
    bindings: BTreeMap<String, AddressBinding>,
}

/// Outcome of one deposit upsert inside the state
enum DepositWrite {
    Inserted,
    Updated,
    Unchanged,
}

impl MemoryState {
    fn balance_mut(&mut self, key: &LedgerKey, user: &str) -> &mut u128 {
        self.balances
            .entry((key.chain.clone(), key.asset.clone(), user.to_string()))
            .or_insert(0)
    }

    fn add_shares(&mut self, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128> {
        let slot = self.balance_mut(key, user);
        let next = apply_delta(key, user, *slot, delta)?;
        *slot = next;
        Ok(next)
    }

    fn upsert_deposit(&mut self, record: &DepositRecord) -> StorageResult<DepositWrite> {
        let id = (record.chain.clone(), record.tx_id.clone());

        if let Some(existing) = self.deposits.get_mut(&id) {
            return Ok(if existing.merge_sighting(record) {
                tracing::debug!(tx_id = %record.tx_id, "deposit re-sighted with newer state");
                DepositWrite::Updated
            } else {
                DepositWrite::Unchanged
            });
        }

        if record.is_confirmed() {
            let delta = to_delta(record.shares_amount, false)?;
            self.add_shares(&record.key(), &record.user_address, delta)?;
        }
        self.deposits.insert(id, record.clone());
        Ok(DepositWrite::Inserted)
    }

    fn upsert_withdrawal(&mut self, record: &WithdrawalRecord) -> StorageResult<bool> {
        let id = (record.chain.clone(), record.tx_id.clone());
        if self.withdrawals.contains_key(&id) {
            return Ok(false);
        }

        let delta = to_delta(record.shares_amount, true)?;
        self.add_shares(&record.key(), &record.user_address, delta)?;
        self.withdrawals.insert(id, record.clone());
        Ok(true)
    }
}

/// In-memory ledger, cursor and binding store
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_cursor(&self, key: &LedgerKey, genesis: u64) -> StorageResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .cursors
            .get(key)
            .and_then(|row| row.position)
            .unwrap_or(genesis))
    }

    async fn set_cursor(&self, key: &LedgerKey, position: u64) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let row = state.cursors.entry(key.clone()).or_default();

        match row.persisted_through {
            Some(through) if position <= through => {
                if row.position.map_or(true, |current| position > current) {
                    row.position = Some(position);
                }
                Ok(())
            }
            through => Err(StorageError::CursorGap(format!(
                "{}: cursor {} beyond persisted range {:?}",
                key, position, through
            ))),
        }
    }

    async fn cursors(&self) -> StorageResult<Vec<CursorState>> {
        let state = self.state.read().await;
        let mut out: Vec<CursorState> = state
            .cursors
            .iter()
            .map(|(key, row)| CursorState {
                key: key.clone(),
                position: row.position,
                persisted_through: row.persisted_through,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn upsert_deposit(&self, record: &DepositRecord) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        Ok(matches!(state.upsert_deposit(record)?, DepositWrite::Inserted))
    }

    async fn upsert_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        state.upsert_withdrawal(record)
    }

    async fn update_share_balance(&self, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128> {
        let mut state = self.state.write().await;
        state.add_shares(key, user, delta)
    }

    async fn apply_batch(
        &self,
        key: &LedgerKey,
        events: &[NormalizedEvent],
        from: u64,
        through: u64,
    ) -> StorageResult<BatchOutcome> {
        let mut guard = self.state.write().await;
        // staged; swapped in only if every event applies
        let mut state = guard.clone();
        let mut outcome = BatchOutcome::default();

        for event in events {
            if &event.key != key {
                outcome.faults.push(LedgerFault {
                    tx_id: event.tx.canonical(),
                    user_address: event.user_address.clone(),
                    message: format!("event for {} delivered to {}", event.key, key),
                });
                continue;
            }

            match event.kind {
                EventKind::Deposit => {
                    let record = event.to_deposit();
                    match state.upsert_deposit(&record)? {
                        DepositWrite::Inserted => outcome.deposits_inserted.push(record),
                        DepositWrite::Updated => outcome.updated += 1,
                        DepositWrite::Unchanged => outcome.duplicates += 1,
                    }
                }
                EventKind::Withdrawal => {
                    let record = event.to_withdrawal();
                    match state.upsert_withdrawal(&record) {
                        Ok(true) => outcome.withdrawals_inserted.push(record),
                        Ok(false) => outcome.duplicates += 1,
                        Err(StorageError::LedgerConsistency(message)) => outcome.faults.push(LedgerFault {
                            tx_id: record.tx_id,
                            user_address: record.user_address,
                            message,
                        }),
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let row = state.cursors.entry(key.clone()).or_default();
        row.persisted_through = next_watermark(row.persisted_through, row.position, from, through);

        *guard = state;
        Ok(outcome)
    }

    async fn get_deposit(&self, chain: &str, tx_id: &str) -> StorageResult<Option<DepositRecord>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .get(&(chain.to_string(), tx_id.to_string()))
            .cloned())
    }

    async fn pending_deposits(&self, chain: &str) -> StorageResult<Vec<DepositRecord>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .values()
            .filter(|d| d.chain == chain && d.status == DepositStatus::Pending)
            .cloned()
            .collect())
    }

    async fn refresh_confirmations(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
        block_position: u64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .deposits
            .get_mut(&(chain.to_string(), tx_id.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("{}:{}", chain, tx_id)))?;

        if confirmations > record.confirmations {
            record.confirmations = confirmations;
        }
        if block_position > 0 && record.block_position == 0 {
            record.block_position = block_position;
        }
        Ok(())
    }

    async fn confirm_deposit(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
    ) -> StorageResult<Option<DepositRecord>> {
        let mut state = self.state.write().await;
        let id = (chain.to_string(), tx_id.to_string());

        let record = match state.deposits.get(&id) {
            Some(r) if r.status == DepositStatus::Pending => r.clone(),
            Some(_) => return Ok(None),
            None => return Err(StorageError::NotFound(format!("{}:{}", chain, tx_id))),
        };

        let delta = to_delta(record.shares_amount, false)?;
        state.add_shares(&record.key(), &record.user_address, delta)?;

        let stored = state
            .deposits
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("{}:{}", chain, tx_id)))?;
        stored.status = DepositStatus::Confirmed;
        stored.confirmations = stored.confirmations.max(confirmations);

        Ok(Some(stored.clone()))
    }

    async fn get_balance(&self, key: &LedgerKey, user: &str) -> StorageResult<u128> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .get(&(key.chain.clone(), key.asset.clone(), user.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn total_shares(&self, key: &LedgerKey) -> StorageResult<u128> {
        let state = self.state.read().await;
        let mut total: u128 = 0;
        for ((chain, asset, _), shares) in &state.balances {
            if chain == &key.chain && asset == &key.asset {
                total = total
                    .checked_add(*shares)
                    .ok_or_else(|| StorageError::InvalidData(format!("{} total overflow", key)))?;
            }
        }
        Ok(total)
    }

    async fn balances(&self, key: &LedgerKey) -> StorageResult<Vec<ShareBalance>> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .iter()
            .filter(|((chain, asset, _), _)| chain == &key.chain && asset == &key.asset)
            .map(|((chain, asset, user), shares)| ShareBalance {
                chain: chain.clone(),
                asset: asset.clone(),
                user_address: user.clone(),
                shares: *shares,
            })
            .collect())
    }

    async fn deposits_by_address(&self, deposit_address: &str) -> StorageResult<Vec<DepositRecord>> {
        let state = self.state.read().await;
        let mut out: Vec<DepositRecord> = state
            .deposits
            .values()
            .filter(|d| d.deposit_address.as_deref() == Some(deposit_address))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.block_position, &a.tx_id).cmp(&(b.block_position, &b.tx_id)));
        Ok(out)
    }

    async fn deposits_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<DepositRecord>> {
        let state = self.state.read().await;
        let mut out: Vec<DepositRecord> = state
            .deposits
            .values()
            .filter(|d| d.chain == key.chain && d.asset == key.asset && d.user_address == user)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.block_position, &a.tx_id).cmp(&(b.block_position, &b.tx_id)));
        Ok(out)
    }

    async fn withdrawals_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<WithdrawalRecord>> {
        let state = self.state.read().await;
        let mut out: Vec<WithdrawalRecord> = state
            .withdrawals
            .values()
            .filter(|w| w.chain == key.chain && w.asset == key.asset && w.user_address == user)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.block_position, &a.tx_id).cmp(&(b.block_position, &b.tx_id)));
        Ok(out)
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn register_address(&self, binding: &AddressBinding) -> StorageResult<AddressBinding> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.bindings.get_mut(&binding.deposit_address) {
            if existing.user_address != binding.user_address {
                return Err(StorageError::Duplicate(binding.deposit_address.clone()));
            }
            existing.active = true;
            return Ok(existing.clone());
        }

        state
            .bindings
            .insert(binding.deposit_address.clone(), binding.clone());
        Ok(binding.clone())
    }

    async fn deactivate_address(&self, deposit_address: &str) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        match state.bindings.get_mut(deposit_address) {
            Some(binding) => {
                binding.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_bindings(&self) -> StorageResult<Vec<AddressBinding>> {
        let state = self.state.read().await;
        Ok(state.bindings.values().filter(|b| b.active).cloned().collect())
    }

    async fn all_bindings(&self) -> StorageResult<Vec<AddressBinding>> {
        let state = self.state.read().await;
        Ok(state.bindings.values().cloned().collect())
    }

    async fn binding_for(&self, deposit_address: &str) -> StorageResult<Option<AddressBinding>> {
        let state = self.state.read().await;
        Ok(state.bindings.get(deposit_address).cloned())
    }
}
