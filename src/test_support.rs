use crate::events::{LogEntry, PurchaseEvent, purchase_topic};
use alloy_primitives::{Address, B256, U256, address, hex};

pub const BUYER_A: Address = address!("00000000000000000000000000000000000000aa");
pub const BUYER_B: Address = address!("00000000000000000000000000000000000000bb");
pub const CONTRACT: Address = address!("4870e705a3def9dda6da7a953d1cd3ccedd08573");

pub fn tx_hash(block: u64, log_index: u64) -> B256 {
    let mut word = [0u8; 32];
    word[16..24].copy_from_slice(&block.to_be_bytes());
    word[24..].copy_from_slice(&log_index.to_be_bytes());
    B256::from(word)
}

pub fn block_hash(block: u64) -> B256 {
    let mut word = [0xb0u8; 32];
    word[24..].copy_from_slice(&block.to_be_bytes());
    B256::from(word)
}

pub fn purchase_log(block: u64, log_index: u64, buyer: Address, eth: u64, tokens: u64) -> LogEntry {
    let event = PurchaseEvent {
        eth_amount: U256::from(eth),
        token_amount: U256::from(tokens),
    };
    LogEntry {
        address: hex::encode_prefixed(CONTRACT),
        topics: vec![
            hex::encode_prefixed(purchase_topic()),
            hex::encode_prefixed(buyer.into_word()),
        ],
        data: event.to_data_hex(),
        block_number: Some(format!("{block:#x}")),
        block_hash: Some(hex::encode_prefixed(block_hash(block))),
        transaction_hash: Some(hex::encode_prefixed(tx_hash(block, log_index))),
        log_index: Some(format!("{log_index:#x}")),
        removed: false,
    }
}
