//! Solana Vault Watcher
//!
//! Pages the signatures touching one vault PDA and decodes the Anchor events
//! the vault program emits (`Program data: <base64>` log lines). Identity is
//! the transaction signature; a transaction is assumed to carry a single
//! vault event.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::UiTransactionEncoding;

use super::{retry_transient, ChainWatcher, FetchedRange, RetryPolicy, WatcherError, WatcherResult};
use crate::types::{
    ChainFamily, DepositStatus, EventKind, LedgerKey, NormalizedEvent, TxIdentifier, SOLANA_CHAIN,
};

/// Signatures per `getSignaturesForAddress` page
pub const SIGNATURE_PAGE_LIMIT: usize = 1000;

/// Confirmation count recorded for finalized transactions
pub const FINALIZED_CONFIRMATIONS: u32 = 32;

const PROGRAM_DATA_PREFIX: &str = "Program data: ";

/// Seed prefix of the per-mint vault account
pub const VAULT_SEED: &[u8] = b"vault";

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DepositEvent {
    pub user: [u8; 32],
    pub amount: u64,
    pub shares: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WithdrawEvent {
    pub user: [u8; 32],
    pub assets: u64,
    pub shares: u64,
    pub timestamp: i64,
}

/// Decoded vault program event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Deposit(DepositEvent),
    Withdraw(WithdrawEvent),
}

/// On-chain `Vault` account, after its 8-byte discriminator
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VaultAccount {
    pub authority: [u8; 32],
    pub token_mint: [u8; 32],
    pub vault_token_account: [u8; 32],
    pub total_assets: u64,
    pub total_shares: u64,
    pub paused: bool,
    pub bump: u8,
}

/// Anchor discriminator: first 8 bytes of sha256("<namespace>:<name>")
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("{}:{}", namespace, name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// Vault PDA for a token mint
pub fn vault_address(program_id: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[VAULT_SEED, mint.as_ref()], program_id).0
}

/// Decode one `Program data` payload; `Ok(None)` for other event types
pub fn decode_event_data(data: &[u8]) -> Result<Option<VaultEvent>, String> {
    if data.len() < 8 {
        return Err(format!("event data too short: {} bytes", data.len()));
    }
    let (tag, mut body) = data.split_at(8);

    if tag == discriminator("event", "DepositEvent") {
        DepositEvent::deserialize(&mut body)
            .map(|e| Some(VaultEvent::Deposit(e)))
            .map_err(|e| format!("invalid DepositEvent: {}", e))
    } else if tag == discriminator("event", "WithdrawEvent") {
        WithdrawEvent::deserialize(&mut body)
            .map(|e| Some(VaultEvent::Withdraw(e)))
            .map_err(|e| format!("invalid WithdrawEvent: {}", e))
    } else {
        Ok(None)
    }
}

/// Decode a `Vault` account's raw data
pub fn decode_vault_account(data: &[u8]) -> Result<VaultAccount, String> {
    if data.len() < 8 || data[..8] != discriminator("account", "Vault") {
        return Err("not a Vault account".to_string());
    }
    VaultAccount::deserialize(&mut &data[8..]).map_err(|e| format!("invalid Vault account: {}", e))
}

/// Vault events emitted by `program_id` in a transaction's log
///
/// Tracks the `invoke` / `success` / `failed` stack so that `Program data`
/// lines emitted by other programs (CPI targets, token program) are not
/// attributed to the vault.
pub fn parse_vault_events(program_id: &Pubkey, logs: &[String]) -> Vec<Result<VaultEvent, String>> {
    let program = program_id.to_string();
    let mut stack: Vec<&str> = Vec::new();
    let mut events = Vec::new();

    for line in logs {
        if let Some(data) = line.strip_prefix(PROGRAM_DATA_PREFIX) {
            if stack.last() != Some(&program.as_str()) {
                continue;
            }
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| format!("invalid base64 event data: {}", e))
                .and_then(|bytes| decode_event_data(&bytes));
            match decoded {
                Ok(Some(event)) => events.push(Ok(event)),
                Ok(None) => {}
                Err(e) => events.push(Err(e)),
            }
            continue;
        }

        let mut parts = line.split_whitespace();
        if parts.next() != Some("Program") {
            continue;
        }
        let (Some(id), Some(action)) = (parts.next(), parts.next()) else {
            continue;
        };
        match action {
            "invoke" => stack.push(id),
            "success" | "failed:" => {
                stack.pop();
            }
            _ => {}
        }
    }

    events
}

/// Map a decoded event to a ledger event for `signature`
pub fn to_normalized(key: &LedgerKey, signature: &str, slot: u64, event: &VaultEvent) -> NormalizedEvent {
    let (kind, user, assets, shares, timestamp) = match event {
        VaultEvent::Deposit(e) => (EventKind::Deposit, e.user, e.amount, e.shares, e.timestamp),
        VaultEvent::Withdraw(e) => (EventKind::Withdrawal, e.user, e.assets, e.shares, e.timestamp),
    };

    NormalizedEvent {
        kind,
        key: key.clone(),
        user_address: Pubkey::new_from_array(user).to_string(),
        deposit_address: None,
        tx: TxIdentifier::solana(signature),
        assets_amount: assets as u128,
        shares_amount: shares as u128,
        timestamp,
        confirmations: FINALIZED_CONFIRMATIONS,
        status: DepositStatus::Confirmed,
        block_position: slot,
    }
}

fn client_error(e: ClientError) -> WatcherError {
    WatcherError::Transient(e.to_string())
}

/// Build a nonblocking RPC client at `finalized` commitment
pub fn connect(rpc_url: &str, timeout: Duration) -> Arc<RpcClient> {
    Arc::new(RpcClient::new_with_timeout_and_commitment(
        rpc_url.to_string(),
        timeout,
        CommitmentConfig::finalized(),
    ))
}

/// A finalized signature touching the vault
struct VaultSignature {
    signature: Signature,
    slot: u64,
}

/// Watches one mint's vault of the vault program
pub struct SolanaWatcher {
    rpc: Arc<RpcClient>,
    key: LedgerKey,
    program_id: Pubkey,
    vault: Pubkey,
    genesis: u64,
    chunk_size: u64,
    live_overlap: u64,
    retry: RetryPolicy,
}

impl SolanaWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<RpcClient>,
        asset: &str,
        program_id: &str,
        mint: &str,
        genesis: u64,
        chunk_size: u64,
        live_overlap: u64,
        retry: RetryPolicy,
    ) -> WatcherResult<Self> {
        let program_id = Pubkey::from_str(program_id)
            .map_err(|_| WatcherError::Permanent(format!("invalid program id: {}", program_id)))?;
        let mint = Pubkey::from_str(mint)
            .map_err(|_| WatcherError::Permanent(format!("invalid mint: {}", mint)))?;

        Ok(Self {
            rpc,
            key: LedgerKey::new(SOLANA_CHAIN, asset),
            vault: vault_address(&program_id, &mint),
            program_id,
            genesis,
            chunk_size: chunk_size.max(1),
            live_overlap,
            retry,
        })
    }

    pub fn vault(&self) -> &Pubkey {
        &self.vault
    }

    /// Successful finalized signatures in `[from, to]`, oldest first
    async fn signatures_in_range(&self, from: u64, to: u64) -> WatcherResult<Vec<VaultSignature>> {
        let mut collected = Vec::new();
        let mut before: Option<Signature> = None;

        'paging: loop {
            let page_before = &before;
            let page = retry_transient(&self.retry, "getSignaturesForAddress", || async move {
                self.rpc
                    .get_signatures_for_address_with_config(
                        &self.vault,
                        GetConfirmedSignaturesForAddress2Config {
                            before: page_before.clone(),
                            until: None,
                            limit: Some(SIGNATURE_PAGE_LIMIT),
                            commitment: Some(CommitmentConfig::finalized()),
                        },
                    )
                    .await
                    .map_err(client_error)
            })
            .await?;

            let Some(last) = page.last() else {
                break;
            };
            before = Some(
                Signature::from_str(&last.signature)
                    .map_err(|_| WatcherError::Malformed(format!("invalid signature {}", last.signature)))?,
            );

            for info in &page {
                if info.slot > to {
                    continue;
                }
                if info.slot < from {
                    break 'paging;
                }
                if info.err.is_some() {
                    continue;
                }
                let signature = Signature::from_str(&info.signature)
                    .map_err(|_| WatcherError::Malformed(format!("invalid signature {}", info.signature)))?;
                collected.push(VaultSignature {
                    signature,
                    slot: info.slot,
                });
            }

            if page.len() < SIGNATURE_PAGE_LIMIT {
                break;
            }
        }

        collected.reverse();
        Ok(collected)
    }

    async fn transaction_logs(&self, signature: &Signature) -> WatcherResult<Vec<String>> {
        let tx = retry_transient(&self.retry, "getTransaction", || async move {
            self.rpc
                .get_transaction_with_config(
                    signature,
                    RpcTransactionConfig {
                        encoding: Some(UiTransactionEncoding::Json),
                        commitment: Some(CommitmentConfig::finalized()),
                        max_supported_transaction_version: Some(0),
                    },
                )
                .await
                .map_err(client_error)
        })
        .await?;

        let meta = tx
            .transaction
            .meta
            .ok_or_else(|| WatcherError::Malformed(format!("transaction {} has no meta", signature)))?;
        Ok(Option::<Vec<String>>::from(meta.log_messages).unwrap_or_default())
    }
}

#[async_trait]
impl ChainWatcher for SolanaWatcher {
    fn key(&self) -> LedgerKey {
        self.key.clone()
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
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
        retry_transient(&self.retry, "getSlot", || async move {
            self.rpc
                .get_slot_with_commitment(CommitmentConfig::finalized())
                .await
                .map_err(client_error)
        })
        .await
    }

    async fn fetch_historical_range(&self, from: u64, to: u64) -> WatcherResult<FetchedRange> {
        let mut range = FetchedRange::default();

        for entry in self.signatures_in_range(from, to).await? {
            let signature = entry.signature.to_string();
            let logs = match self.transaction_logs(&entry.signature).await {
                Ok(logs) => logs,
                Err(e @ WatcherError::Transient(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Skipping transaction {}: {}", signature, e);
                    range.skip(signature, e.to_string());
                    continue;
                }
            };

            let mut events = parse_vault_events(&self.program_id, &logs).into_iter();
            match events.next() {
                Some(Ok(event)) => {
                    range.events.push(to_normalized(&self.key, &signature, entry.slot, &event));
                }
                Some(Err(reason)) => {
                    tracing::warn!("Skipping undecodable event in {}: {}", signature, reason);
                    range.skip(signature.clone(), reason);
                }
                None => continue,
            }

            let extra = events.count();
            if extra > 0 {
                tracing::warn!(
                    "Transaction {} carries {} additional vault events; only the first is indexed",
                    signature,
                    extra
                );
                range.skip(signature, format!("{} additional vault events not indexed", extra));
            }
        }

        Ok(range)
    }

    /// `total_shares` of the vault account as of slot `at`
    ///
    /// Account state is only served at the head, so the finalized value is
    /// read together with its context slot and the vault events finalized
    /// after `at` are rolled back out of it.
    async fn authoritative_total_shares(&self, at: u64) -> WatcherResult<u128> {
        let response = retry_transient(&self.retry, "getAccountInfo", || async move {
            self.rpc
                .get_account_with_commitment(&self.vault, CommitmentConfig::finalized())
                .await
                .map_err(client_error)
        })
        .await?;
        let read_at = response.context.slot;
        if read_at < at {
            return Err(WatcherError::Transient(format!(
                "vault read at slot {} is behind slot {}",
                read_at, at
            )));
        }

        let account = response
            .value
            .ok_or_else(|| WatcherError::Permanent(format!("vault account {} not found", self.vault)))?;
        let vault = decode_vault_account(&account.data).map_err(WatcherError::Malformed)?;
        let head_total = vault.total_shares as u128;
        if read_at == at {
            return Ok(head_total);
        }

        let later = self.fetch_historical_range(at + 1, read_at).await?;
        tracing::debug!(
            "Rolling vault total back from slot {} to {} over {} events",
            read_at,
            at,
            later.events.len()
        );
        total_before(head_total, &later)
    }
}

/// Vault total before the events of `later` were applied
pub fn total_before(head_total: u128, later: &FetchedRange) -> WatcherResult<u128> {
    if !later.skipped.is_empty() {
        return Err(WatcherError::Transient(format!(
            "{} unreadable vault events after the reconciliation slot",
            later.skipped.len()
        )));
    }

    let mut total = head_total;
    for event in &later.events {
        total = match event.kind {
            EventKind::Deposit => total.checked_sub(event.shares_amount),
            EventKind::Withdrawal => total.checked_add(event.shares_amount),
        }
        .ok_or_else(|| {
            WatcherError::Malformed(format!(
                "vault total {} inconsistent with {}",
                head_total,
                event.tx.canonical()
            ))
        })?;
    }
    Ok(total)
}
