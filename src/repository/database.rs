use anyhow::{Context, Result};
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {db_path}"))?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL lets the query CLI read while the indexer writes; FULL makes a
        // returned commit durable.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("Failed to set journal mode")?;
        conn.pragma_update(None, "synchronous", "FULL")
            .context("Failed to set synchronous mode")?;

        let db = Database { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                block_number INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS purchases (
                transaction_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                buyer TEXT NOT NULL,
                eth_amount TEXT NOT NULL,
                token_amount TEXT NOT NULL,
                PRIMARY KEY (transaction_hash, log_index)
            );

            CREATE INDEX IF NOT EXISTS idx_purchases_block_number
                ON purchases(block_number);

            CREATE INDEX IF NOT EXISTS idx_purchases_buyer
                ON purchases(buyer);

            CREATE TABLE IF NOT EXISTS balances (
                address TEXT PRIMARY KEY,
                eth_amount_padded TEXT NOT NULL,
                token_amount_padded TEXT NOT NULL,
                purchases INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_balances_token_amount
                ON balances(token_amount_padded);

            CREATE TABLE IF NOT EXISTS sale_totals (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_received TEXT NOT NULL,
                tokens_sold TEXT NOT NULL,
                purchases INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS block_hashes (
                block_number INTEGER PRIMARY KEY,
                block_hash TEXT NOT NULL
            );",
        )?;

        Ok(())
    }
}
