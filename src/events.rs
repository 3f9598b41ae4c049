use crate::error::DecodeError;
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256, hex};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

sol! {
    event LogDonation(address indexed buyer, uint256 ethAmount, uint256 tokenAmount);
}

/// "0x" followed by two 32-byte words.
pub const PURCHASE_DATA_LEN: usize = 2 + 64 + 64;

const WORD_HEX_LEN: usize = 2 + 64;

pub fn purchase_topic() -> B256 {
    LogDonation::SIGNATURE_HASH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseEvent {
    pub eth_amount: U256,
    pub token_amount: U256,
}

impl PurchaseEvent {
    /// Wire form of the log `data` field.
    pub fn to_data_hex(&self) -> String {
        let mut words = [0u8; 64];
        words[..32].copy_from_slice(&self.eth_amount.to_be_bytes::<32>());
        words[32..].copy_from_slice(&self.token_amount.to_be_bytes::<32>());
        hex::encode_prefixed(words)
    }
}

/// Unique on-chain identity of one log. Ordered by block, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventIdentity {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
}

impl EventIdentity {
    /// Lowest identity any log of `block_number` can have.
    pub fn block_start(block_number: u64) -> Self {
        Self {
            block_number,
            log_index: 0,
            transaction_hash: B256::ZERO,
        }
    }
}

impl fmt::Display for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:?}",
            self.block_number, self.log_index, self.transaction_hash
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CatchUp,
    Live,
}

/// A log as it appears on the JSON-RPC wire, every field still hex text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default)]
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl From<&Log> for LogEntry {
    fn from(log: &Log) -> Self {
        LogEntry {
            address: hex::encode_prefixed(log.address()),
            topics: log.topics().iter().map(hex::encode_prefixed).collect(),
            data: hex::encode_prefixed(&log.data().data),
            block_number: log.block_number.map(|n| format!("{n:#x}")),
            block_hash: log.block_hash.map(hex::encode_prefixed),
            transaction_hash: log.transaction_hash.map(hex::encode_prefixed),
            log_index: log.log_index.map(|i| format!("{i:#x}")),
            removed: log.removed,
        }
    }
}

/// A validated purchase together with where it sits on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPurchase {
    pub identity: EventIdentity,
    pub buyer: Address,
    pub event: PurchaseEvent,
    pub block_hash: Option<B256>,
    pub removed: bool,
}

/// Decodes the fixed-layout `data` payload into the two amounts.
pub fn decode_purchase_data(data: &str) -> Result<PurchaseEvent, DecodeError> {
    let digits = data.strip_prefix("0x").ok_or(DecodeError::MissingPrefix)?;
    if data.len() != PURCHASE_DATA_LEN {
        return Err(DecodeError::InvalidLength(data.len()));
    }
    if let Some(offset) = digits.bytes().position(|b| !b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(offset + 2));
    }

    let (eth, token) = digits.split_at(64);
    Ok(PurchaseEvent {
        eth_amount: parse_word_amount(eth)?,
        token_amount: parse_word_amount(token)?,
    })
}

fn parse_word_amount(digits: &str) -> Result<U256, DecodeError> {
    U256::from_str_radix(digits, 16).map_err(|_| DecodeError::InvalidField {
        field: "amount",
        value: digits.to_string(),
    })
}

fn parse_topic(index: usize, value: &str) -> Result<B256, DecodeError> {
    let invalid = || DecodeError::InvalidTopic {
        index,
        value: value.to_string(),
    };
    if value.len() != WORD_HEX_LEN || !value.starts_with("0x") {
        return Err(invalid());
    }
    B256::from_str(value).map_err(|_| invalid())
}

/// Extracts the buyer from a zero-padded address topic.
pub fn decode_buyer(topic: &str) -> Result<Address, DecodeError> {
    let word = parse_topic(1, topic)?;
    if word[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::InvalidTopic {
            index: 1,
            value: topic.to_string(),
        });
    }
    Ok(Address::from_word(word))
}

/// Parses a `0x`-prefixed hex quantity such as a block number or log index.
pub fn parse_quantity(field: &'static str, value: Option<&str>) -> Result<u64, DecodeError> {
    let value = value.ok_or(DecodeError::MissingField(field))?;
    let invalid = || DecodeError::InvalidField {
        field,
        value: value.to_string(),
    };
    let digits = value.strip_prefix("0x").ok_or_else(invalid)?;
    u64::from_str_radix(digits, 16).map_err(|_| invalid())
}

fn parse_hash(field: &'static str, value: Option<&str>) -> Result<B256, DecodeError> {
    let value = value.ok_or(DecodeError::MissingField(field))?;
    if value.len() != WORD_HEX_LEN || !value.starts_with("0x") {
        return Err(DecodeError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    B256::from_str(value).map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// The single decode path for purchase logs, whichever source delivered them.
pub fn decode_log(entry: &LogEntry) -> Result<DecodedPurchase, DecodeError> {
    if entry.topics.len() < 2 {
        return Err(DecodeError::MissingTopics(entry.topics.len()));
    }
    let signature = parse_topic(0, &entry.topics[0])?;
    if signature != purchase_topic() {
        return Err(DecodeError::SignatureMismatch {
            expected: purchase_topic(),
            found: signature,
        });
    }

    let event = decode_purchase_data(&entry.data)?;
    let buyer = decode_buyer(&entry.topics[1])?;

    let identity = EventIdentity {
        block_number: parse_quantity("blockNumber", entry.block_number.as_deref())?,
        log_index: parse_quantity("logIndex", entry.log_index.as_deref())?,
        transaction_hash: parse_hash("transactionHash", entry.transaction_hash.as_deref())?,
    };
    let block_hash = match entry.block_hash.as_deref() {
        Some(hash) => Some(parse_hash("blockHash", Some(hash))?),
        None => None,
    };

    Ok(DecodedPurchase {
        identity,
        buyer,
        event,
        block_hash,
        removed: entry.removed,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl BlockTag {
    pub fn to_rpc(self) -> String {
        match self {
            BlockTag::Number(n) => format!("{n:#x}"),
            BlockTag::Latest => "latest".to_string(),
        }
    }
}

impl From<BlockTag> for BlockNumberOrTag {
    fn from(tag: BlockTag) -> Self {
        match tag {
            BlockTag::Number(n) => BlockNumberOrTag::Number(n),
            BlockTag::Latest => BlockNumberOrTag::Latest,
        }
    }
}

/// Selects purchase logs of one contract, optionally bounded to a block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterQuery {
    pub from_block: BlockTag,
    pub to_block: BlockTag,
    pub address: Address,
    pub topics: Vec<B256>,
}

impl FilterQuery {
    pub fn purchases(address: Address) -> Self {
        Self {
            from_block: BlockTag::Number(0),
            to_block: BlockTag::Latest,
            address,
            topics: vec![purchase_topic()],
        }
    }

    pub fn range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block: BlockTag::Number(from_block),
            to_block: BlockTag::Number(to_block),
            ..self.clone()
        }
    }

    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new()
            .address(self.address)
            .from_block(BlockNumberOrTag::from(self.from_block))
            .to_block(BlockNumberOrTag::from(self.to_block));
        if let Some(topic0) = self.topics.first() {
            filter = filter.event_signature(*topic0);
        }
        filter
    }

    /// Parameters of an `eth_getLogs` style range query.
    pub fn range_params(&self) -> Value {
        json!({
            "fromBlock": self.from_block.to_rpc(),
            "toBlock": self.to_block.to_rpc(),
            "address": hex::encode_prefixed(self.address),
            "topics": self.topic_strings(),
        })
    }

    /// Parameters of an `eth_subscribe("logs", ..)` request; ranges do not apply.
    pub fn subscription_params(&self) -> Value {
        json!({
            "address": hex::encode_prefixed(self.address),
            "topics": self.topic_strings(),
        })
    }

    fn topic_strings(&self) -> Vec<String> {
        self.topics.iter().map(hex::encode_prefixed).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BUYER_A, purchase_log};

    #[test]
    fn decodes_single_purchase_scenario() {
        let data = format!("0x{}64{}0186a0", "0".repeat(62), "0".repeat(58));
        assert_eq!(data.len(), PURCHASE_DATA_LEN);

        let mut log = purchase_log(100, 0, BUYER_A, 1, 1);
        log.data = data;

        let decoded = decode_log(&log).unwrap();
        assert_eq!(decoded.event.eth_amount, U256::from(100));
        assert_eq!(decoded.event.token_amount, U256::from(100_000));
        assert_eq!(decoded.buyer, BUYER_A);
        assert_eq!(decoded.identity.block_number, 100);
        assert_eq!(decoded.identity.log_index, 0);
        assert!(!decoded.removed);
    }

    #[test]
    fn data_round_trips_through_wire_form() {
        let event = PurchaseEvent {
            eth_amount: U256::MAX,
            token_amount: U256::from(0x0186a0u64),
        };
        assert_eq!(decode_purchase_data(&event.to_data_hex()).unwrap(), event);
    }

    #[test]
    fn rejects_bad_data() {
        let good = PurchaseEvent {
            eth_amount: U256::from(1),
            token_amount: U256::from(2),
        }
        .to_data_hex();

        assert_eq!(
            decode_purchase_data(&good[..128]),
            Err(DecodeError::InvalidLength(128))
        );
        assert_eq!(
            decode_purchase_data(&format!("{good}00")),
            Err(DecodeError::InvalidLength(132))
        );
        assert_eq!(
            decode_purchase_data(&format!("00{}", &good[2..])),
            Err(DecodeError::MissingPrefix)
        );

        let mut bad_digit = good.clone();
        bad_digit.replace_range(40..41, "g");
        assert_eq!(
            decode_purchase_data(&bad_digit),
            Err(DecodeError::InvalidHex(40))
        );
    }

    #[test]
    fn rejects_foreign_signature_and_short_topics() {
        let mut log = purchase_log(5, 0, BUYER_A, 1, 1);
        log.topics[0] = hex::encode_prefixed(B256::repeat_byte(0xab));
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::SignatureMismatch { .. })
        ));

        let mut log = purchase_log(5, 0, BUYER_A, 1, 1);
        log.topics.truncate(1);
        assert_eq!(decode_log(&log), Err(DecodeError::MissingTopics(1)));
    }

    #[test]
    fn rejects_unpadded_buyer_topic() {
        let topic = hex::encode_prefixed(B256::repeat_byte(0x11));
        assert!(matches!(
            decode_buyer(&topic),
            Err(DecodeError::InvalidTopic { index: 1, .. })
        ));
    }

    #[test]
    fn pending_logs_without_position_are_rejected() {
        let mut log = purchase_log(5, 0, BUYER_A, 1, 1);
        log.block_number = None;
        assert_eq!(
            decode_log(&log),
            Err(DecodeError::MissingField("blockNumber"))
        );
    }

    #[test]
    fn identities_order_by_block_then_log_index() {
        let high_hash = EventIdentity {
            block_number: 7,
            log_index: 1,
            transaction_hash: B256::repeat_byte(0xff),
        };
        let later_index = EventIdentity {
            block_number: 7,
            log_index: 2,
            transaction_hash: B256::ZERO,
        };
        assert!(high_hash < later_index);
        assert!(EventIdentity::block_start(7) < high_hash);
        assert!(later_index < EventIdentity::block_start(8));
    }

    #[test]
    fn filter_params_use_hex_block_numbers() {
        let query = FilterQuery::purchases(BUYER_A).range(0x39b710, 0x39b7ff);
        let params = query.range_params();
        assert_eq!(params["fromBlock"], "0x39b710");
        assert_eq!(params["toBlock"], "0x39b7ff");
        assert_eq!(
            params["topics"][0],
            hex::encode_prefixed(purchase_topic()).as_str()
        );
        assert!(query.subscription_params().get("fromBlock").is_none());
        assert_eq!(FilterQuery::purchases(BUYER_A).to_block.to_rpc(), "latest");
    }

    #[test]
    fn deserializes_node_json() {
        let raw = json!({
            "data": PurchaseEvent { eth_amount: U256::from(1), token_amount: U256::from(2) }.to_data_hex(),
            "blockNumber": "0x39be8a",
            "blockHash": "0x13c78cc9af138ecf3d9dc135a93cb07d905ea2383559ecf245b9af689fbbc119",
            "address": "0x4870e705a3def9dda6da7a953d1cd3ccedd08573",
            "transactionHash": "0x11816e6f08d4ed62aa1d8bc97ec547b1428d2b952fa4ad683fcf33c7dcb49158",
            "topics": [
                hex::encode_prefixed(purchase_topic()),
                "0x00000000000000000000000055b30722d84ca292e4432f644f183d1986d2b8f9"
            ],
            "logIndex": "0x3",
            "type": "mined"
        });
        let entry: LogEntry = serde_json::from_value(raw).unwrap();
        let decoded = decode_log(&entry).unwrap();
        assert_eq!(decoded.identity.block_number, 0x39be8a);
        assert_eq!(decoded.identity.log_index, 3);
        assert_eq!(
            decoded.buyer,
            Address::from_str("0x55b30722d84ca292e4432f644f183d1986d2b8f9").unwrap()
        );
        assert!(decoded.block_hash.is_some());
    }
}
