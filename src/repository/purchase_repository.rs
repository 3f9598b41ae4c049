use super::models::{PurchaseRecord, PurchaseStats};
use crate::error::StoreError;
use crate::ledger::AppliedPurchase;
use crate::repository::{BalanceRepository, CheckpointRepository};
use alloy_primitives::{Address, B256, U256};
use rusqlite::{Row, ToSql, params, params_from_iter};
use std::str::FromStr;

pub struct PurchaseRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> PurchaseRepository<'a> {
    // A duplicate identity violates the primary key; plain INSERT surfaces it.
    const INSERT_PURCHASE: &'static str = "INSERT INTO purchases (
            transaction_hash, log_index, block_number, buyer, eth_amount, token_amount
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

    const SELECT_PURCHASE: &'static str = "SELECT transaction_hash, log_index, block_number, buyer, eth_amount, token_amount FROM purchases";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Runs inside the caller's transaction.
    pub fn insert_batch(&self, purchases: &[AppliedPurchase]) -> Result<usize, StoreError> {
        let mut stmt = self.conn.prepare(Self::INSERT_PURCHASE)?;
        let mut count = 0;

        for purchase in purchases {
            count += stmt.execute(params![
                format!("{:?}", purchase.identity.transaction_hash),
                purchase.identity.log_index,
                purchase.identity.block_number,
                format!("{:?}", purchase.buyer),
                purchase.event.eth_amount.to_string(),
                purchase.event.token_amount.to_string(),
            ])?;
        }

        Ok(count)
    }

    pub fn query_purchases(
        &self,
        buyer: Option<&Address>,
        block_range: Option<(u64, u64)>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PurchaseRecord>, StoreError> {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(buyer) = buyer {
            conditions.push("buyer = ?");
            params.push(Box::new(format!("{buyer:?}")));
        }

        if let Some((start, end)) = block_range {
            conditions.push("block_number >= ?");
            params.push(Box::new(start));
            conditions.push("block_number <= ?");
            params.push(Box::new(end));
        }

        let mut query = Self::SELECT_PURCHASE.to_string();
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(&format!(
            " ORDER BY block_number, log_index LIMIT {limit} OFFSET {offset}"
        ));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::row_to_purchase)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn get_statistics(&self) -> Result<PurchaseStats, StoreError> {
        let total_purchases: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM purchases", [], |row| row.get(0))?;

        let unique_buyers: usize =
            self.conn
                .query_row("SELECT COUNT(DISTINCT buyer) FROM purchases", [], |row| {
                    row.get(0)
                })?;

        let (earliest_block, latest_block): (Option<u64>, Option<u64>) = self.conn.query_row(
            "SELECT MIN(block_number), MAX(block_number) FROM purchases",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let totals = BalanceRepository::new(self.conn).get_totals()?;
        let checkpoint = CheckpointRepository::new(self.conn).get()?;

        Ok(PurchaseStats {
            checkpoint,
            total_purchases,
            unique_buyers,
            earliest_block,
            latest_block,
            total_received: totals.total_received,
            tokens_sold: totals.tokens_sold,
        })
    }

    fn row_to_purchase(row: &Row) -> rusqlite::Result<PurchaseRecord> {
        let conversion = |index: usize, e: Box<dyn std::error::Error + Send + Sync>| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e)
        };

        let transaction_hash = row
            .get::<_, String>(0)?
            .parse::<B256>()
            .map_err(|e| conversion(0, Box::new(e)))?;
        let buyer =
            Address::from_str(&row.get::<_, String>(3)?).map_err(|e| conversion(3, Box::new(e)))?;
        let eth_amount =
            U256::from_str(&row.get::<_, String>(4)?).map_err(|e| conversion(4, Box::new(e)))?;
        let token_amount =
            U256::from_str(&row.get::<_, String>(5)?).map_err(|e| conversion(5, Box::new(e)))?;

        Ok(PurchaseRecord {
            transaction_hash,
            log_index: row.get(1)?,
            block_number: row.get(2)?,
            buyer,
            eth_amount,
            token_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventIdentity, PurchaseEvent, Source};
    use crate::repository::Database;
    use crate::test_support::{BUYER_A, BUYER_B, tx_hash};

    fn purchase(block: u64, log_index: u64, buyer: Address) -> AppliedPurchase {
        AppliedPurchase {
            identity: EventIdentity {
                block_number: block,
                log_index,
                transaction_hash: tx_hash(block, log_index),
            },
            buyer,
            event: PurchaseEvent {
                eth_amount: U256::from(block),
                token_amount: U256::from(block * 1000),
            },
            source: Source::CatchUp,
        }
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let repo = PurchaseRepository::new(&db.conn);

        assert_eq!(repo.insert_batch(&[purchase(1, 0, BUYER_A)]).unwrap(), 1);
        assert!(matches!(
            repo.insert_batch(&[purchase(1, 0, BUYER_A)]),
            Err(StoreError::Sqlite(_))
        ));
    }

    #[test]
    fn filters_by_buyer_and_range() {
        let db = Database::open_in_memory().unwrap();
        let repo = PurchaseRepository::new(&db.conn);
        repo.insert_batch(&[
            purchase(10, 0, BUYER_A),
            purchase(10, 1, BUYER_B),
            purchase(12, 0, BUYER_A),
            purchase(20, 3, BUYER_A),
        ])
        .unwrap();

        let mine = repo.query_purchases(Some(&BUYER_A), None, 100, 0).unwrap();
        assert_eq!(mine.len(), 3);
        assert_eq!(mine[0].block_number, 10);
        assert_eq!(mine[2].log_index, 3);

        let ranged = repo.query_purchases(None, Some((10, 12)), 100, 0).unwrap();
        assert_eq!(ranged.len(), 3);

        let stats = repo.get_statistics().unwrap();
        assert_eq!(stats.total_purchases, 4);
        assert_eq!(stats.unique_buyers, 2);
        assert_eq!(stats.earliest_block, Some(10));
        assert_eq!(stats.latest_block, Some(20));
    }
}
