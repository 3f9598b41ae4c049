use crate::error::StoreError;
use crate::ledger::{AppliedPurchase, Balance, SaleTotals};
use alloy_primitives::{Address, U256};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::str::FromStr;

pub struct BalanceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> BalanceRepository<'a> {
    const SELECT_BALANCE: &'static str = "SELECT eth_amount_padded, token_amount_padded, purchases
         FROM balances WHERE address = ?1";

    const UPSERT_BALANCE: &'static str =
        "INSERT INTO balances (address, eth_amount_padded, token_amount_padded, purchases)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(address) DO UPDATE SET
            eth_amount_padded = excluded.eth_amount_padded,
            token_amount_padded = excluded.token_amount_padded,
            purchases = excluded.purchases";

    const SELECT_TOTALS: &'static str =
        "SELECT total_received, tokens_sold, purchases FROM sale_totals WHERE id = 1";

    const UPSERT_TOTALS: &'static str =
        "INSERT INTO sale_totals (id, total_received, tokens_sold, purchases)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            total_received = excluded.total_received,
            tokens_sold = excluded.tokens_sold,
            purchases = excluded.purchases";

    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Pad a U256 amount to 78 digits so lexical order matches numeric order.
    /// U256 max is approximately 10^77, so 78 digits is sufficient
    pub fn pad_amount(amount: &U256) -> String {
        format!("{amount:0>78}")
    }

    pub fn parse_padded(padded: &str) -> Result<U256, StoreError> {
        let trimmed = padded.trim_start_matches('0');
        if trimmed.is_empty() {
            return Ok(U256::ZERO);
        }
        U256::from_str(trimmed)
            .map_err(|_| StoreError::Corrupt(format!("invalid stored amount {padded}")))
    }

    /// Zero balance when the address never purchased.
    pub fn get_balance(&self, address: &Address) -> Result<Balance, StoreError> {
        let row: Option<(String, String, u64)> = self
            .conn
            .query_row(Self::SELECT_BALANCE, params![format!("{address:?}")], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;

        match row {
            Some((eth, token, purchases)) => Ok(Balance {
                eth_amount: Self::parse_padded(&eth)?,
                token_amount: Self::parse_padded(&token)?,
                purchases,
            }),
            None => Ok(Balance::default()),
        }
    }

    /// Adds a batch of purchases to the stored balances and totals.
    /// Runs inside the caller's transaction.
    pub fn apply_purchases(&self, purchases: &[AppliedPurchase]) -> Result<(), StoreError> {
        if purchases.is_empty() {
            return Ok(());
        }

        let mut deltas: HashMap<Address, Balance> = HashMap::new();
        let mut totals = self.get_totals()?;

        for purchase in purchases {
            let delta = deltas.entry(purchase.buyer).or_default();
            delta.eth_amount = checked_sum(delta.eth_amount, purchase.event.eth_amount, "eth paid")?;
            delta.token_amount =
                checked_sum(delta.token_amount, purchase.event.token_amount, "tokens bought")?;
            delta.purchases += 1;

            totals.total_received = checked_sum(
                totals.total_received,
                purchase.event.eth_amount,
                "total received",
            )?;
            totals.tokens_sold =
                checked_sum(totals.tokens_sold, purchase.event.token_amount, "tokens sold")?;
            totals.purchases += 1;
        }

        let mut stmt = self.conn.prepare(Self::UPSERT_BALANCE)?;
        for (address, delta) in &deltas {
            let current = self.get_balance(address)?;
            let eth_amount = checked_sum(current.eth_amount, delta.eth_amount, "eth paid")?;
            let token_amount =
                checked_sum(current.token_amount, delta.token_amount, "tokens bought")?;
            stmt.execute(params![
                format!("{address:?}"),
                Self::pad_amount(&eth_amount),
                Self::pad_amount(&token_amount),
                current.purchases + delta.purchases,
            ])?;
        }

        self.conn.execute(
            Self::UPSERT_TOTALS,
            params![
                totals.total_received.to_string(),
                totals.tokens_sold.to_string(),
                totals.purchases,
            ],
        )?;

        Ok(())
    }

    pub fn get_totals(&self) -> Result<SaleTotals, StoreError> {
        let row: Option<(String, String, u64)> = self
            .conn
            .query_row(Self::SELECT_TOTALS, [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;

        match row {
            Some((received, sold, purchases)) => Ok(SaleTotals {
                total_received: Self::parse_padded(&received)?,
                tokens_sold: Self::parse_padded(&sold)?,
                purchases,
            }),
            None => Ok(SaleTotals::default()),
        }
    }

    pub fn all_balances(&self) -> Result<HashMap<Address, Balance>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT address, eth_amount_padded, token_amount_padded, purchases FROM balances",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut balances = HashMap::with_capacity(rows.len());
        for (address, eth, token, purchases) in rows {
            let address = Address::from_str(&address)
                .map_err(|_| StoreError::Corrupt(format!("invalid stored address {address}")))?;
            balances.insert(
                address,
                Balance {
                    eth_amount: Self::parse_padded(&eth)?,
                    token_amount: Self::parse_padded(&token)?,
                    purchases,
                },
            );
        }

        Ok(balances)
    }

    /// Get top buyers sorted by token amount
    pub fn get_top_buyers(&self, limit: usize) -> Result<Vec<(Address, Balance)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT address, eth_amount_padded, token_amount_padded, purchases FROM balances
             ORDER BY token_amount_padded DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(address, eth, token, purchases)| {
                let address = Address::from_str(&address).map_err(|_| {
                    StoreError::Corrupt(format!("invalid stored address {address}"))
                })?;
                Ok((
                    address,
                    Balance {
                        eth_amount: Self::parse_padded(&eth)?,
                        token_amount: Self::parse_padded(&token)?,
                        purchases,
                    },
                ))
            })
            .collect()
    }
}

fn checked_sum(current: U256, amount: U256, what: &'static str) -> Result<U256, StoreError> {
    current.checked_add(amount).ok_or(StoreError::Overflow(what))
}
