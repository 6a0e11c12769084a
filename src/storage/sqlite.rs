//! SQLite Persistent Storage for the Ledger
//!
//! Provides durable storage for cursors, ledger records, share balances and
//! address bindings. Uses connection pooling via r2d2 for concurrent access.
//!
//! Every mutation runs inside one `IMMEDIATE` transaction, so a record and
//! the balance change it implies are written together or not at all, and
//! concurrent check-and-set calls serialize on the database write lock.
//! Amounts are stored as decimal TEXT since SQLite integers stop at i64.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

use super::traits::{
    apply_delta, next_watermark, to_delta, BatchOutcome, BindingStore, CursorState, CursorStore,
    LedgerFault, LedgerStore, StorageError, StorageResult,
};
use crate::types::{
    parse_amount, AddressBinding, DepositRecord, DepositStatus, EventKind, LedgerKey, NormalizedEvent,
    ShareBalance, WithdrawalRecord,
};

/// SQLite-backed store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

enum DepositWrite {
    Inserted,
    Updated,
    Unchanged,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                chain TEXT NOT NULL,
                tx_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                user_address TEXT NOT NULL,
                deposit_address TEXT,
                assets_amount TEXT NOT NULL,
                shares_amount TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                confirmations INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                block_position INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain, tx_id)
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(chain, status);
            CREATE INDEX IF NOT EXISTS idx_deposits_address ON deposits(deposit_address);
            CREATE INDEX IF NOT EXISTS idx_deposits_user ON deposits(chain, asset, user_address);

            CREATE TABLE IF NOT EXISTS withdrawals (
                chain TEXT NOT NULL,
                tx_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                user_address TEXT NOT NULL,
                assets_amount TEXT NOT NULL,
                shares_amount TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                block_position INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (chain, tx_id)
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_user ON withdrawals(chain, asset, user_address);

            CREATE TABLE IF NOT EXISTS share_balances (
                chain TEXT NOT NULL,
                asset TEXT NOT NULL,
                user_address TEXT NOT NULL,
                shares TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain, asset, user_address)
            );

            CREATE TABLE IF NOT EXISTS cursors (
                chain TEXT NOT NULL,
                asset TEXT NOT NULL,
                position INTEGER,
                persisted_through INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain, asset)
            );

            CREATE TABLE IF NOT EXISTS address_bindings (
                deposit_address TEXT PRIMARY KEY,
                user_address TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    /// Read a TEXT amount column
    fn amount_col(row: &rusqlite::Row, idx: &str) -> rusqlite::Result<u128> {
        let raw: String = row.get(idx)?;
        parse_amount(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                Type::Text,
                Box::new(StorageError::InvalidData(format!("{} is not an amount: {}", idx, raw))),
            )
        })
    }

    /// Convert a database row to DepositRecord
    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositRecord> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse::<DepositStatus>().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(StorageError::InvalidData(e)))
        })?;

        Ok(DepositRecord {
            chain: row.get("chain")?,
            asset: row.get("asset")?,
            user_address: row.get("user_address")?,
            deposit_address: row.get("deposit_address")?,
            tx_id: row.get("tx_id")?,
            assets_amount: Self::amount_col(row, "assets_amount")?,
            shares_amount: Self::amount_col(row, "shares_amount")?,
            timestamp: row.get("timestamp")?,
            confirmations: row.get::<_, i64>("confirmations")? as u32,
            status,
            block_position: row.get::<_, i64>("block_position")? as u64,
        })
    }

    /// Convert a database row to WithdrawalRecord
    fn row_to_withdrawal(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalRecord> {
        Ok(WithdrawalRecord {
            chain: row.get("chain")?,
            asset: row.get("asset")?,
            user_address: row.get("user_address")?,
            tx_id: row.get("tx_id")?,
            assets_amount: Self::amount_col(row, "assets_amount")?,
            shares_amount: Self::amount_col(row, "shares_amount")?,
            timestamp: row.get("timestamp")?,
            block_position: row.get::<_, i64>("block_position")? as u64,
        })
    }

    fn row_to_binding(row: &rusqlite::Row) -> rusqlite::Result<AddressBinding> {
        Ok(AddressBinding {
            user_address: row.get("user_address")?,
            deposit_address: row.get("deposit_address")?,
            active: row.get::<_, i64>("active")? != 0,
            created_at: row.get("created_at")?,
        })
    }

    // Helpers operating on an open transaction

    fn read_balance(conn: &Connection, key: &LedgerKey, user: &str) -> StorageResult<u128> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT shares FROM share_balances WHERE chain = ?1 AND asset = ?2 AND user_address = ?3",
                params![key.chain, key.asset, user],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match raw {
            Some(s) => parse_amount(&s).ok_or_else(|| StorageError::InvalidData(format!("bad balance: {}", s))),
            None => Ok(0),
        }
    }

    fn add_shares(conn: &Connection, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128> {
        let current = Self::read_balance(conn, key, user)?;
        let next = apply_delta(key, user, current, delta)?;

        conn.execute(
            r#"
            INSERT INTO share_balances (chain, asset, user_address, shares, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (chain, asset, user_address)
            DO UPDATE SET shares = excluded.shares, updated_at = excluded.updated_at
            "#,
            params![key.chain, key.asset, user, next.to_string(), now_secs()],
        )
        .map_err(db_err)?;

        Ok(next)
    }

    fn find_deposit(conn: &Connection, chain: &str, tx_id: &str) -> StorageResult<Option<DepositRecord>> {
        conn.query_row(
            "SELECT * FROM deposits WHERE chain = ?1 AND tx_id = ?2",
            params![chain, tx_id],
            Self::row_to_deposit,
        )
        .optional()
        .map_err(db_err)
    }

    fn upsert_deposit_in(conn: &Connection, record: &DepositRecord) -> StorageResult<DepositWrite> {
        if let Some(mut existing) = Self::find_deposit(conn, &record.chain, &record.tx_id)? {
            if !existing.merge_sighting(record) {
                return Ok(DepositWrite::Unchanged);
            }
            conn.execute(
                r#"
                UPDATE deposits SET confirmations = ?3, block_position = ?4, timestamp = ?5, updated_at = ?6
                WHERE chain = ?1 AND tx_id = ?2
                "#,
                params![
                    existing.chain,
                    existing.tx_id,
                    existing.confirmations as i64,
                    existing.block_position as i64,
                    existing.timestamp,
                    now_secs(),
                ],
            )
            .map_err(db_err)?;
            tracing::debug!(tx_id = %record.tx_id, "deposit re-sighted with newer state");
            return Ok(DepositWrite::Updated);
        }

        if record.is_confirmed() {
            let delta = to_delta(record.shares_amount, false)?;
            Self::add_shares(conn, &record.key(), &record.user_address, delta)?;
        }

        let now = now_secs();
        conn.execute(
            r#"
            INSERT INTO deposits (
                chain, tx_id, asset, user_address, deposit_address,
                assets_amount, shares_amount, timestamp, confirmations, status,
                block_position, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.chain,
                record.tx_id,
                record.asset,
                record.user_address,
                record.deposit_address,
                record.assets_amount.to_string(),
                record.shares_amount.to_string(),
                record.timestamp,
                record.confirmations as i64,
                record.status.to_string(),
                record.block_position as i64,
                now,
                now,
            ],
        )
        .map_err(db_err)?;

        Ok(DepositWrite::Inserted)
    }

    fn upsert_withdrawal_in(conn: &Connection, record: &WithdrawalRecord) -> StorageResult<bool> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM withdrawals WHERE chain = ?1 AND tx_id = ?2",
                params![record.chain, record.tx_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if exists.is_some() {
            return Ok(false);
        }

        let delta = to_delta(record.shares_amount, true)?;
        Self::add_shares(conn, &record.key(), &record.user_address, delta)?;

        conn.execute(
            r#"
            INSERT INTO withdrawals (
                chain, tx_id, asset, user_address, assets_amount, shares_amount,
                timestamp, block_position, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.chain,
                record.tx_id,
                record.asset,
                record.user_address,
                record.assets_amount.to_string(),
                record.shares_amount.to_string(),
                record.timestamp,
                record.block_position as i64,
                now_secs(),
            ],
        )
        .map_err(db_err)?;

        Ok(true)
    }

    fn cursor_row(conn: &Connection, key: &LedgerKey) -> StorageResult<Option<(Option<u64>, Option<u64>)>> {
        conn.query_row(
            "SELECT position, persisted_through FROM cursors WHERE chain = ?1 AND asset = ?2",
            params![key.chain, key.asset],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.map(|v| v as u64),
                    row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                ))
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn query_deposits(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<DepositRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, Self::row_to_deposit)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // Synchronous implementations of the trait methods

    fn get_cursor_sync(&self, key: &LedgerKey, genesis: u64) -> StorageResult<u64> {
        let conn = self.conn()?;
        Ok(Self::cursor_row(&conn, key)?
            .and_then(|(position, _)| position)
            .unwrap_or(genesis))
    }

    fn set_cursor_sync(&self, key: &LedgerKey, position: u64) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let (current, through) = Self::cursor_row(&tx, key)?.unwrap_or((None, None));
        match through {
            Some(through) if position <= through => {}
            through => {
                return Err(StorageError::CursorGap(format!(
                    "{}: cursor {} beyond persisted range {:?}",
                    key, position, through
                )))
            }
        }

        if current.map_or(true, |c| position > c) {
            tx.execute(
                "UPDATE cursors SET position = ?3, updated_at = ?4 WHERE chain = ?1 AND asset = ?2",
                params![key.chain, key.asset, position as i64, now_secs()],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)
    }

    fn cursors_sync(&self) -> StorageResult<Vec<CursorState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT chain, asset, position, persisted_through FROM cursors ORDER BY chain, asset")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CursorState {
                    key: LedgerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    position: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    persisted_through: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn upsert_deposit_sync(&self, record: &DepositRecord) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let write = Self::upsert_deposit_in(&tx, record)?;
        tx.commit().map_err(db_err)?;
        Ok(matches!(write, DepositWrite::Inserted))
    }

    fn upsert_withdrawal_sync(&self, record: &WithdrawalRecord) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let inserted = Self::upsert_withdrawal_in(&tx, record)?;
        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }

    fn update_share_balance_sync(&self, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let balance = Self::add_shares(&tx, key, user, delta)?;
        tx.commit().map_err(db_err)?;
        Ok(balance)
    }

    fn apply_batch_sync(
        &self,
        key: &LedgerKey,
        events: &[NormalizedEvent],
        from: u64,
        through: u64,
    ) -> StorageResult<BatchOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
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
                    match Self::upsert_deposit_in(&tx, &record)? {
                        DepositWrite::Inserted => outcome.deposits_inserted.push(record),
                        DepositWrite::Updated => outcome.updated += 1,
                        DepositWrite::Unchanged => outcome.duplicates += 1,
                    }
                }
                EventKind::Withdrawal => {
                    let record = event.to_withdrawal();
                    // the balance check runs before any write for this unit
                    match Self::upsert_withdrawal_in(&tx, &record) {
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

        let (position, current) = Self::cursor_row(&tx, key)?.unwrap_or((None, None));
        let watermark = next_watermark(current, position, from, through);
        tx.execute(
            r#"
            INSERT INTO cursors (chain, asset, position, persisted_through, updated_at)
            VALUES (?1, ?2, NULL, ?3, ?4)
            ON CONFLICT (chain, asset)
            DO UPDATE SET persisted_through = excluded.persisted_through, updated_at = excluded.updated_at
            "#,
            params![key.chain, key.asset, watermark.map(|w| w as i64), now_secs()],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(outcome)
    }

    fn get_deposit_sync(&self, chain: &str, tx_id: &str) -> StorageResult<Option<DepositRecord>> {
        let conn = self.conn()?;
        Self::find_deposit(&conn, chain, tx_id)
    }

    fn refresh_confirmations_sync(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
        block_position: u64,
    ) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"
                UPDATE deposits SET
                    confirmations = MAX(confirmations, ?3),
                    block_position = CASE WHEN block_position = 0 THEN ?4 ELSE block_position END,
                    updated_at = ?5
                WHERE chain = ?1 AND tx_id = ?2
                "#,
                params![chain, tx_id, confirmations as i64, block_position as i64, now_secs()],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(format!("{}:{}", chain, tx_id)));
        }
        Ok(())
    }

    fn confirm_deposit_sync(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
    ) -> StorageResult<Option<DepositRecord>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let changed = tx
            .execute(
                r#"
                UPDATE deposits SET status = ?3, confirmations = MAX(confirmations, ?4), updated_at = ?5
                WHERE chain = ?1 AND tx_id = ?2 AND status = ?6
                "#,
                params![
                    chain,
                    tx_id,
                    DepositStatus::Confirmed.to_string(),
                    confirmations as i64,
                    now_secs(),
                    DepositStatus::Pending.to_string(),
                ],
            )
            .map_err(db_err)?;

        let record = Self::find_deposit(&tx, chain, tx_id)?
            .ok_or_else(|| StorageError::NotFound(format!("{}:{}", chain, tx_id)))?;

        if changed == 0 {
            return Ok(None);
        }

        let delta = to_delta(record.shares_amount, false)?;
        Self::add_shares(&tx, &record.key(), &record.user_address, delta)?;
        tx.commit().map_err(db_err)?;

        Ok(Some(record))
    }

    fn balances_sync(&self, key: &LedgerKey) -> StorageResult<Vec<ShareBalance>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_address, shares FROM share_balances WHERE chain = ?1 AND asset = ?2 ORDER BY user_address",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![key.chain, key.asset], |row| {
                Ok(ShareBalance {
                    chain: key.chain.clone(),
                    asset: key.asset.clone(),
                    user_address: row.get(0)?,
                    shares: Self::amount_col(row, "shares")?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn total_shares_sync(&self, key: &LedgerKey) -> StorageResult<u128> {
        let mut total: u128 = 0;
        for balance in self.balances_sync(key)? {
            total = total
                .checked_add(balance.shares)
                .ok_or_else(|| StorageError::InvalidData(format!("{} total overflow", key)))?;
        }
        Ok(total)
    }

    fn withdrawals_for_user_sync(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<WithdrawalRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM withdrawals
                WHERE chain = ?1 AND asset = ?2 AND user_address = ?3
                ORDER BY block_position, tx_id
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![key.chain, key.asset, user], Self::row_to_withdrawal)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn register_address_sync(&self, binding: &AddressBinding) -> StorageResult<AddressBinding> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT * FROM address_bindings WHERE deposit_address = ?1",
                params![binding.deposit_address],
                Self::row_to_binding,
            )
            .optional()
            .map_err(db_err)?;

        let stored = match existing {
            Some(existing) if existing.user_address != binding.user_address => {
                return Err(StorageError::Duplicate(binding.deposit_address.clone()));
            }
            Some(mut existing) => {
                if !existing.active {
                    tx.execute(
                        "UPDATE address_bindings SET active = 1 WHERE deposit_address = ?1",
                        params![existing.deposit_address],
                    )
                    .map_err(db_err)?;
                    existing.active = true;
                }
                existing
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO address_bindings (deposit_address, user_address, active, created_at)
                    VALUES (?1, ?2, 1, ?3)
                    "#,
                    params![binding.deposit_address, binding.user_address, binding.created_at],
                )
                .map_err(db_err)?;
                AddressBinding {
                    active: true,
                    ..binding.clone()
                }
            }
        };

        tx.commit().map_err(db_err)?;
        Ok(stored)
    }

    fn deactivate_address_sync(&self, deposit_address: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE address_bindings SET active = 0 WHERE deposit_address = ?1",
                params![deposit_address],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    fn bindings_sync(&self, active_only: bool) -> StorageResult<Vec<AddressBinding>> {
        let sql = if active_only {
            "SELECT * FROM address_bindings WHERE active = 1 ORDER BY deposit_address"
        } else {
            "SELECT * FROM address_bindings ORDER BY deposit_address"
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], Self::row_to_binding)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn binding_for_sync(&self, deposit_address: &str) -> StorageResult<Option<AddressBinding>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM address_bindings WHERE deposit_address = ?1",
            params![deposit_address],
            Self::row_to_binding,
        )
        .optional()
        .map_err(db_err)
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn get_cursor(&self, key: &LedgerKey, genesis: u64) -> StorageResult<u64> {
        self.get_cursor_sync(key, genesis)
    }

    async fn set_cursor(&self, key: &LedgerKey, position: u64) -> StorageResult<()> {
        self.set_cursor_sync(key, position)
    }

    async fn cursors(&self) -> StorageResult<Vec<CursorState>> {
        self.cursors_sync()
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn upsert_deposit(&self, record: &DepositRecord) -> StorageResult<bool> {
        self.upsert_deposit_sync(record)
    }

    async fn upsert_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<bool> {
        self.upsert_withdrawal_sync(record)
    }

    async fn update_share_balance(&self, key: &LedgerKey, user: &str, delta: i128) -> StorageResult<u128> {
        self.update_share_balance_sync(key, user, delta)
    }

    async fn apply_batch(
        &self,
        key: &LedgerKey,
        events: &[NormalizedEvent],
        from: u64,
        through: u64,
    ) -> StorageResult<BatchOutcome> {
        self.apply_batch_sync(key, events, from, through)
    }

    async fn get_deposit(&self, chain: &str, tx_id: &str) -> StorageResult<Option<DepositRecord>> {
        self.get_deposit_sync(chain, tx_id)
    }

    async fn pending_deposits(&self, chain: &str) -> StorageResult<Vec<DepositRecord>> {
        self.query_deposits(
            "SELECT * FROM deposits WHERE chain = ?1 AND status = ?2 ORDER BY block_position, tx_id",
            &[&chain, &DepositStatus::Pending.to_string()],
        )
    }

    async fn refresh_confirmations(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
        block_position: u64,
    ) -> StorageResult<()> {
        self.refresh_confirmations_sync(chain, tx_id, confirmations, block_position)
    }

    async fn confirm_deposit(
        &self,
        chain: &str,
        tx_id: &str,
        confirmations: u32,
    ) -> StorageResult<Option<DepositRecord>> {
        self.confirm_deposit_sync(chain, tx_id, confirmations)
    }

    async fn get_balance(&self, key: &LedgerKey, user: &str) -> StorageResult<u128> {
        let conn = self.conn()?;
        Self::read_balance(&conn, key, user)
    }

    async fn total_shares(&self, key: &LedgerKey) -> StorageResult<u128> {
        self.total_shares_sync(key)
    }

    async fn balances(&self, key: &LedgerKey) -> StorageResult<Vec<ShareBalance>> {
        self.balances_sync(key)
    }

    async fn deposits_by_address(&self, deposit_address: &str) -> StorageResult<Vec<DepositRecord>> {
        self.query_deposits(
            "SELECT * FROM deposits WHERE deposit_address = ?1 ORDER BY block_position, tx_id",
            &[&deposit_address],
        )
    }

    async fn deposits_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<DepositRecord>> {
        self.query_deposits(
            r#"
            SELECT * FROM deposits
            WHERE chain = ?1 AND asset = ?2 AND user_address = ?3
            ORDER BY block_position, tx_id
            "#,
            &[&key.chain, &key.asset, &user],
        )
    }

    async fn withdrawals_for_user(&self, key: &LedgerKey, user: &str) -> StorageResult<Vec<WithdrawalRecord>> {
        self.withdrawals_for_user_sync(key, user)
    }
}

#[async_trait]
impl BindingStore for SqliteStore {
    async fn register_address(&self, binding: &AddressBinding) -> StorageResult<AddressBinding> {
        self.register_address_sync(binding)
    }

    async fn deactivate_address(&self, deposit_address: &str) -> StorageResult<bool> {
        self.deactivate_address_sync(deposit_address)
    }

    async fn active_bindings(&self) -> StorageResult<Vec<AddressBinding>> {
        self.bindings_sync(true)
    }

    async fn all_bindings(&self) -> StorageResult<Vec<AddressBinding>> {
        self.bindings_sync(false)
    }

    async fn binding_for(&self, deposit_address: &str) -> StorageResult<Option<AddressBinding>> {
        self.binding_for_sync(deposit_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxIdentifier;

    fn btc_key() -> LedgerKey {
        LedgerKey::new("bitcoin", "BTC")
    }

    fn btc_deposit(txid: &str, vout: u32, sats: u128, confirmations: u32) -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::Deposit,
            key: btc_key(),
            user_address: "alice".to_string(),
            deposit_address: Some("tb1qalice".to_string()),
            tx: TxIdentifier::bitcoin(txid, vout),
            assets_amount: sats,
            shares_amount: sats,
            timestamp: 0,
            confirmations,
            status: DepositStatus::Pending,
            block_position: 0,
        }
    }

    #[tokio::test]
    async fn test_apply_batch_and_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let events = vec![btc_deposit("aa", 0, 50_000, 0), btc_deposit("aa", 1, 20_000, 0)];

        let outcome = store.apply_batch(&btc_key(), &events, 1, 10).await.unwrap();
        assert_eq!(outcome.deposits_inserted.len(), 2);
        assert_eq!(outcome.confirmed_first_inserts().count(), 0);

        let replay = store.apply_batch(&btc_key(), &events, 1, 10).await.unwrap();
        assert_eq!(replay.inserted(), 0);
        assert_eq!(replay.duplicates, 2);

        let by_address = store.deposits_by_address("tb1qalice").await.unwrap();
        assert_eq!(by_address.len(), 2);
        assert_eq!(by_address[0].assets_amount, 50_000);
        assert_eq!(store.pending_deposits("bitcoin").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resighting_keeps_highest_confirmations() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .apply_batch(&btc_key(), &[btc_deposit("bb", 0, 1_000, 2)], 1, 5)
            .await
            .unwrap();

        let outcome = store
            .apply_batch(&btc_key(), &[btc_deposit("bb", 0, 1_000, 1)], 1, 5)
            .await
            .unwrap();
        assert_eq!(outcome.duplicates, 1);

        let stored = store.get_deposit("bitcoin", "bb:0").await.unwrap().unwrap();
        assert_eq!(stored.confirmations, 2);
    }

    #[tokio::test]
    async fn test_confirm_deposit_credits_once() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .apply_batch(&btc_key(), &[btc_deposit("cc", 0, 50_000, 0)], 1, 5)
            .await
            .unwrap();

        let first = store.confirm_deposit("bitcoin", "cc:0", 3).await.unwrap();
        let second = store.confirm_deposit("bitcoin", "cc:0", 4).await.unwrap();

        assert_eq!(first.map(|r| r.status), Some(DepositStatus::Confirmed));
        assert!(second.is_none());
        assert_eq!(store.get_balance(&btc_key(), "alice").await.unwrap(), 50_000);
        assert_eq!(store.total_shares(&btc_key()).await.unwrap(), 50_000);
        assert!(store.pending_deposits("bitcoin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_cannot_go_negative() {
        let store = SqliteStore::in_memory().unwrap();
        let key = btc_key();

        store.update_share_balance(&key, "alice", 100).await.unwrap();
        let err = store.update_share_balance(&key, "alice", -101).await;
        assert!(matches!(err, Err(StorageError::LedgerConsistency(_))));
        assert_eq!(store.get_balance(&key, "alice").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_cursor_gap_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let key = LedgerKey::new("base", "USDC");

        assert_eq!(store.get_cursor(&key, 42).await.unwrap(), 42);
        assert!(matches!(
            store.set_cursor(&key, 100).await,
            Err(StorageError::CursorGap(_))
        ));

        store.apply_batch(&key, &[], 43, 100).await.unwrap();
        store.set_cursor(&key, 100).await.unwrap();
        assert_eq!(store.get_cursor(&key, 42).await.unwrap(), 100);

        // a non-contiguous range does not move the watermark
        store.apply_batch(&key, &[], 150, 200).await.unwrap();
        assert!(matches!(
            store.set_cursor(&key, 200).await,
            Err(StorageError::CursorGap(_))
        ));

        let cursors = store.cursors().await.unwrap();
        assert_eq!(cursors[0].persisted_through, Some(100));
    }

    #[tokio::test]
    async fn test_bindings() {
        let store = SqliteStore::in_memory().unwrap();
        let binding = AddressBinding::new("alice", "tb1qalice");

        store.register_address(&binding).await.unwrap();
        assert!(matches!(
            store.register_address(&AddressBinding::new("bob", "tb1qalice")).await,
            Err(StorageError::Duplicate(_))
        ));

        assert!(store.deactivate_address("tb1qalice").await.unwrap());
        assert!(store.active_bindings().await.unwrap().is_empty());
        assert_eq!(store.all_bindings().await.unwrap().len(), 1);
        let stored = store.binding_for("tb1qalice").await.unwrap().unwrap();
        assert!(!stored.active);
    }
}
