use crate::query::formatters::{
    OutputFormat, format_balance, format_purchases, format_stats, format_top_buyers,
};
use crate::repository::{BalanceRepository, PurchaseRepository};
use alloy_primitives::Address;
use anyhow::Result;
use std::str::FromStr;

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address).map_err(|_| anyhow::anyhow!("Invalid address format: {}", address))
}

pub fn cmd_balance(
    balance_repo: &BalanceRepository,
    address: &str,
    token_decimals: u8,
    format: &OutputFormat,
) -> Result<String> {
    let address = parse_address(address)?;
    let balance = balance_repo.get_balance(&address)?;
    Ok(format_balance(&address, &balance, token_decimals, format))
}

#[derive(Default)]
pub struct PurchaseQuery {
    pub buyer: Option<String>,
    pub block: Option<u64>,
    pub block_range: Option<(u64, u64)>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_purchases(
    purchase_repo: &PurchaseRepository,
    query: PurchaseQuery,
    token_decimals: u8,
    format: &OutputFormat,
) -> Result<String> {
    let buyer = query.buyer.as_deref().map(parse_address).transpose()?;

    let block_range = match query.block {
        Some(block_num) => Some((block_num, block_num)),
        None => query.block_range,
    };
    if let Some((start, end)) = block_range {
        if start > end {
            anyhow::bail!("Invalid block range: {} is after {}", start, end);
        }
    }

    let purchases =
        purchase_repo.query_purchases(buyer.as_ref(), block_range, query.limit, query.offset)?;
    Ok(format_purchases(&purchases, token_decimals, format))
}

pub fn cmd_top_buyers(
    balance_repo: &BalanceRepository,
    count: usize,
    token_decimals: u8,
    format: &OutputFormat,
) -> Result<String> {
    let buyers = balance_repo.get_top_buyers(count)?;
    Ok(format_top_buyers(&buyers, token_decimals, format))
}

pub fn cmd_stats(
    purchase_repo: &PurchaseRepository,
    token_decimals: u8,
    format: &OutputFormat,
) -> Result<String> {
    let stats = purchase_repo.get_statistics()?;
    Ok(format_stats(&stats, token_decimals, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventIdentity, PurchaseEvent, Source};
    use crate::ledger::{AppliedPurchase, LedgerCommit};
    use crate::repository::{LedgerStore, SqliteStore};
    use crate::test_support::{BUYER_A, BUYER_B, tx_hash};
    use alloy_primitives::U256;

    fn store() -> SqliteStore {
        let purchase = |block: u64, buyer: Address, tokens: u64| AppliedPurchase {
            identity: EventIdentity {
                block_number: block,
                log_index: 0,
                transaction_hash: tx_hash(block, 0),
            },
            buyer,
            event: PurchaseEvent {
                eth_amount: U256::from(1),
                token_amount: U256::from(tokens),
            },
            source: Source::CatchUp,
        };
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .commit(&LedgerCommit {
                previous_checkpoint: 0,
                checkpoint: 30,
                purchases: vec![
                    purchase(10, BUYER_A, 5),
                    purchase(20, BUYER_B, 50),
                    purchase(30, BUYER_A, 7),
                ],
                block_hashes: vec![],
            })
            .unwrap();
        store
    }

    #[test]
    fn balance_rejects_bad_address() {
        let store = store();
        let repo = BalanceRepository::new(&store.database().conn);
        assert!(cmd_balance(&repo, "0xnope", 18, &OutputFormat::Table).is_err());
    }

    #[test]
    fn balance_reports_accumulated_amounts() {
        let store = store();
        let repo = BalanceRepository::new(&store.database().conn);
        let output = cmd_balance(&repo, &format!("{BUYER_A:?}"), 0, &OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["tokens_raw"], "12");
        assert_eq!(value["purchases"], 2);
    }

    #[test]
    fn purchases_filter_by_buyer_and_block() {
        let store = store();
        let repo = PurchaseRepository::new(&store.database().conn);

        let query = PurchaseQuery {
            buyer: Some(format!("{BUYER_A:?}")),
            limit: 10,
            ..Default::default()
        };
        let output = cmd_purchases(&repo, query, 0, &OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);

        let query = PurchaseQuery {
            block: Some(20),
            limit: 10,
            ..Default::default()
        };
        let output = cmd_purchases(&repo, query, 0, &OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value[0]["block_number"], 20);
    }

    #[test]
    fn purchases_reject_inverted_range() {
        let store = store();
        let repo = PurchaseRepository::new(&store.database().conn);
        let query = PurchaseQuery {
            block_range: Some((30, 10)),
            limit: 10,
            ..Default::default()
        };
        assert!(cmd_purchases(&repo, query, 0, &OutputFormat::Table).is_err());
    }

    #[test]
    fn top_buyers_ranked_by_tokens() {
        let store = store();
        let repo = BalanceRepository::new(&store.database().conn);
        let output = cmd_top_buyers(&repo, 5, 0, &OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value[0]["address"], format!("{BUYER_B:?}"));
        assert_eq!(value[1]["address"], format!("{BUYER_A:?}"));
    }
}
