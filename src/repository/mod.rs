pub mod balance_repository;
pub mod checkpoint_repository;
pub mod database;
pub mod ledger_store;
pub mod models;
pub mod purchase_repository;

pub use balance_repository::BalanceRepository;
pub use checkpoint_repository::CheckpointRepository;
pub use database::Database;
pub use ledger_store::{CheckpointStore, LedgerStore, SqliteStore};
pub use models::{PurchaseRecord, PurchaseStats};
pub use purchase_repository::PurchaseRepository;
