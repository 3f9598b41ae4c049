use crate::error::StoreError;
use alloy_primitives::B256;
use rusqlite::{OptionalExtension, params};

pub struct CheckpointRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> CheckpointRepository<'a> {
    const GET_CHECKPOINT: &'static str = "SELECT block_number FROM checkpoint WHERE id = 1";

    const UPSERT_CHECKPOINT: &'static str = "INSERT INTO checkpoint (id, block_number) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET block_number = excluded.block_number";

    const UPSERT_BLOCK_HASH: &'static str =
        "INSERT OR REPLACE INTO block_hashes (block_number, block_hash) VALUES (?1, ?2)";

    const GET_BLOCK_HASH_AT_OR_BELOW: &'static str = "SELECT block_number, block_hash FROM block_hashes
         WHERE block_number <= ?1
         ORDER BY block_number DESC
         LIMIT 1";

    // Keeps the newest row at or below the checkpoint even when it is older than `below`.
    const PRUNE_BLOCK_HASHES: &'static str = "DELETE FROM block_hashes
         WHERE block_number < ?1
           AND block_number < (SELECT MAX(block_number) FROM block_hashes WHERE block_number <= ?2)";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Stored checkpoint, zero when nothing was ever processed.
    pub fn get(&self) -> Result<u64, StoreError> {
        let block: Option<u64> = self
            .conn
            .query_row(Self::GET_CHECKPOINT, [], |row| row.get(0))
            .optional()?;
        Ok(block.unwrap_or(0))
    }

    /// Moves the checkpoint from `expected` to `block`.
    /// Must run inside a write transaction for the check and the write to be atomic.
    pub fn compare_and_set(&self, expected: u64, block: u64) -> Result<(), StoreError> {
        let current = self.get()?;
        if current != expected {
            return Err(StoreError::CheckpointConflict {
                expected,
                found: current,
            });
        }
        if block < current {
            return Err(StoreError::CheckpointRegression {
                current,
                requested: block,
            });
        }

        self.conn.execute(Self::UPSERT_CHECKPOINT, params![block])?;
        Ok(())
    }

    pub fn record_block_hashes(&self, hashes: &[(u64, B256)]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(Self::UPSERT_BLOCK_HASH)?;
        for (block_number, hash) in hashes {
            stmt.execute(params![block_number, format!("{hash:?}")])?;
        }
        Ok(())
    }

    /// Deletes hashes recorded below `below`, returning how many went.
    pub fn prune_block_hashes(&self, below: u64, checkpoint: u64) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute(Self::PRUNE_BLOCK_HASHES, params![below, checkpoint])?)
    }

    pub fn block_hash_at_or_below(&self, block: u64) -> Result<Option<(u64, B256)>, StoreError> {
        let row: Option<(u64, String)> = self
            .conn
            .query_row(Self::GET_BLOCK_HASH_AT_OR_BELOW, params![block], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        row.map(|(number, hash)| {
            hash.parse::<B256>()
                .map(|hash| (number, hash))
                .map_err(|_| StoreError::Corrupt(format!("invalid stored block hash {hash}")))
        })
        .transpose()
    }
}
