//! Durable checkpoint and ledger store.
//!
//! The coordinator only sees the [`CheckpointStore`] and [`LedgerStore`]
//! contracts; [`SqliteStore`] is the implementation the indexer runs with.

use crate::error::StoreError;
use crate::ledger::{LedgerCommit, LedgerSnapshot};
use crate::repository::{BalanceRepository, CheckpointRepository, Database, PurchaseRepository};
use alloy_primitives::B256;
use rusqlite::TransactionBehavior;

pub trait CheckpointStore: Send {
    /// Highest fully processed block; zero when none.
    fn load(&self) -> Result<u64, StoreError>;

    /// Moves the checkpoint from `expected` to `block`, durable on return.
    /// Fails instead of overwriting a value other than `expected` or lowering it.
    fn save(&mut self, expected: u64, block: u64) -> Result<(), StoreError>;
}

pub trait LedgerStore: CheckpointStore {
    fn load_ledger(&self) -> Result<LedgerSnapshot, StoreError>;

    /// Persists purchases, balances, totals, block hashes and the new
    /// checkpoint atomically, guarded by the same compare-and-set as `save`.
    fn commit(&mut self, commit: &LedgerCommit) -> Result<(), StoreError>;

    /// Most recent recorded block hash at or below `block`.
    fn recorded_block_hash(&self, block: u64) -> Result<Option<(u64, B256)>, StoreError>;
}

/// Block hashes kept below the checkpoint when none is configured.
pub const DEFAULT_HASH_RETENTION: u64 = 128;

pub struct SqliteStore {
    db: Database,
    hash_retention: u64,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            hash_retention: DEFAULT_HASH_RETENTION,
        }
    }

    /// Number of blocks below the checkpoint whose hashes survive a commit.
    pub fn with_hash_retention(mut self, blocks: u64) -> Self {
        self.hash_retention = blocks;
        self
    }

    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        Ok(Self::new(Database::new(db_path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl CheckpointStore for SqliteStore {
    fn load(&self) -> Result<u64, StoreError> {
        CheckpointRepository::new(&self.db.conn).get()
    }

    fn save(&mut self, expected: u64, block: u64) -> Result<(), StoreError> {
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        CheckpointRepository::new(&tx).compare_and_set(expected, block)?;
        tx.commit()?;
        Ok(())
    }
}

impl LedgerStore for SqliteStore {
    fn load_ledger(&self) -> Result<LedgerSnapshot, StoreError> {
        let balances = BalanceRepository::new(&self.db.conn);
        Ok(LedgerSnapshot {
            checkpoint: CheckpointRepository::new(&self.db.conn).get()?,
            balances: balances.all_balances()?,
            totals: balances.get_totals()?,
        })
    }

    fn commit(&mut self, commit: &LedgerCommit) -> Result<(), StoreError> {
        let retention = self.hash_retention;
        let tx = self
            .db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let checkpoints = CheckpointRepository::new(&tx);
        checkpoints.compare_and_set(commit.previous_checkpoint, commit.checkpoint)?;
        checkpoints.record_block_hashes(&commit.block_hashes)?;
        checkpoints.prune_block_hashes(
            commit.checkpoint.saturating_sub(retention),
            commit.checkpoint,
        )?;

        PurchaseRepository::new(&tx).insert_batch(&commit.purchases)?;
        BalanceRepository::new(&tx).apply_purchases(&commit.purchases)?;

        tx.commit()?;
        Ok(())
    }

    fn recorded_block_hash(&self, block: u64) -> Result<Option<(u64, B256)>, StoreError> {
        CheckpointRepository::new(&self.db.conn).block_hash_at_or_below(block)
    }
}
