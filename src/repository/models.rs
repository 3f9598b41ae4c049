use alloy_primitives::{Address, B256, U256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub buyer: Address,
    pub eth_amount: U256,
    pub token_amount: U256,
}

#[derive(Debug)]
pub struct PurchaseStats {
    pub checkpoint: u64,
    pub total_purchases: usize,
    pub unique_buyers: usize,
    pub earliest_block: Option<u64>,
    pub latest_block: Option<u64>,
    pub total_received: U256,
    pub tokens_sold: U256,
}

