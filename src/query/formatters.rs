use crate::ledger::Balance;
use crate::repository::{PurchaseRecord, PurchaseStats};
use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, U256};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

const ETH_DECIMALS: u8 = 18;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn units(amount: U256, decimals: u8) -> String {
    format_units(amount, decimals).unwrap_or_else(|_| amount.to_string())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn finish_csv(wtr: Writer<Vec<u8>>) -> String {
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

pub fn format_purchases(
    purchases: &[PurchaseRecord],
    token_decimals: u8,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_purchases_table(purchases, token_decimals),
        OutputFormat::Json => format_purchases_json(purchases, token_decimals),
        OutputFormat::Csv => format_purchases_csv(purchases, token_decimals),
    }
}

fn format_purchases_table(purchases: &[PurchaseRecord], token_decimals: u8) -> String {
    if purchases.is_empty() {
        return "No purchases found.".to_string();
    }

    let mut table = new_table(vec!["Block", "Buyer", "ETH", "Tokens", "Tx Hash"]);
    for purchase in purchases {
        table.add_row(vec![
            Cell::new(purchase.block_number),
            Cell::new(format!("{:#}", purchase.buyer)),
            Cell::new(units(purchase.eth_amount, ETH_DECIMALS)),
            Cell::new(units(purchase.token_amount, token_decimals)),
            Cell::new(format_tx_hash(&format!("{:?}", purchase.transaction_hash))),
        ]);
    }

    table.to_string()
}

fn format_purchases_json(purchases: &[PurchaseRecord], token_decimals: u8) -> String {
    let json_purchases: Vec<_> = purchases
        .iter()
        .map(|p| {
            json!({
                "block_number": p.block_number,
                "transaction_hash": format!("{:?}", p.transaction_hash),
                "log_index": p.log_index,
                "buyer": format!("{:?}", p.buyer),
                "eth": units(p.eth_amount, ETH_DECIMALS),
                "eth_wei": p.eth_amount.to_string(),
                "tokens": units(p.token_amount, token_decimals),
                "tokens_raw": p.token_amount.to_string(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_purchases).unwrap_or_else(|_| "[]".to_string())
}

fn format_purchases_csv(purchases: &[PurchaseRecord], token_decimals: u8) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record([
        "block_number",
        "buyer",
        "eth",
        "eth_wei",
        "tokens",
        "tokens_raw",
        "transaction_hash",
        "log_index",
    ]);

    for purchase in purchases {
        let _ = wtr.write_record([
            &purchase.block_number.to_string(),
            &format!("{:?}", purchase.buyer),
            &units(purchase.eth_amount, ETH_DECIMALS),
            &purchase.eth_amount.to_string(),
            &units(purchase.token_amount, token_decimals),
            &purchase.token_amount.to_string(),
            &format!("{:?}", purchase.transaction_hash),
            &purchase.log_index.to_string(),
        ]);
    }

    finish_csv(wtr)
}

pub fn format_balance(
    address: &Address,
    balance: &Balance,
    token_decimals: u8,
    format: &OutputFormat,
) -> String {
    let eth_formatted = units(balance.eth_amount, ETH_DECIMALS);
    let tokens_formatted = units(balance.token_amount, token_decimals);

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value (Formatted)", "Value (Raw)"]);
            table.add_row(vec![
                Cell::new("ETH Paid"),
                Cell::new(&eth_formatted),
                Cell::new(balance.eth_amount.to_string()),
            ]);
            table.add_row(vec![
                Cell::new("Tokens Bought"),
                Cell::new(&tokens_formatted),
                Cell::new(balance.token_amount.to_string()),
            ]);
            table.add_row(vec![
                Cell::new("Purchases"),
                Cell::new(balance.purchases),
                Cell::new(balance.purchases),
            ]);
            table.to_string()
        }
        OutputFormat::Json => json!({
            "address": format!("{:?}", address),
            "eth": eth_formatted,
            "eth_wei": balance.eth_amount.to_string(),
            "tokens": tokens_formatted,
            "tokens_raw": balance.token_amount.to_string(),
            "purchases": balance.purchases,
        })
        .to_string(),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value_formatted", "value_raw"]);
            let _ = wtr.write_record(["eth_paid", &eth_formatted, &balance.eth_amount.to_string()]);
            let _ = wtr.write_record([
                "tokens_bought",
                &tokens_formatted,
                &balance.token_amount.to_string(),
            ]);
            let purchases = balance.purchases.to_string();
            let _ = wtr.write_record(["purchases", &purchases, &purchases]);
            finish_csv(wtr)
        }
    }
}

pub fn format_top_buyers(
    buyers: &[(Address, Balance)],
    token_decimals: u8,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => {
            if buyers.is_empty() {
                return "No buyers found.".to_string();
            }
            let mut table = new_table(vec!["Rank", "Address", "Tokens", "ETH", "Purchases"]);
            for (i, (address, balance)) in buyers.iter().enumerate() {
                table.add_row(vec![
                    Cell::new(i + 1),
                    Cell::new(format!("{:#}", address)),
                    Cell::new(units(balance.token_amount, token_decimals)),
                    Cell::new(units(balance.eth_amount, ETH_DECIMALS)),
                    Cell::new(balance.purchases),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let json_buyers: Vec<_> = buyers
                .iter()
                .enumerate()
                .map(|(i, (address, balance))| {
                    json!({
                        "rank": i + 1,
                        "address": format!("{:?}", address),
                        "tokens": units(balance.token_amount, token_decimals),
                        "tokens_raw": balance.token_amount.to_string(),
                        "eth": units(balance.eth_amount, ETH_DECIMALS),
                        "eth_wei": balance.eth_amount.to_string(),
                        "purchases": balance.purchases,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&json_buyers).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["rank", "address", "tokens_raw", "eth_wei", "purchases"]);
            for (i, (address, balance)) in buyers.iter().enumerate() {
                let _ = wtr.write_record([
                    &(i + 1).to_string(),
                    &format!("{:?}", address),
                    &balance.token_amount.to_string(),
                    &balance.eth_amount.to_string(),
                    &balance.purchases.to_string(),
                ]);
            }
            finish_csv(wtr)
        }
    }
}

pub fn format_stats(stats: &PurchaseStats, token_decimals: u8, format: &OutputFormat) -> String {
    let block_or_na = |block: Option<u64>| block.map_or("N/A".to_string(), |b| b.to_string());
    let rows = [
        ("checkpoint", stats.checkpoint.to_string()),
        ("total_purchases", stats.total_purchases.to_string()),
        ("unique_buyers", stats.unique_buyers.to_string()),
        ("earliest_block", block_or_na(stats.earliest_block)),
        ("latest_block", block_or_na(stats.latest_block)),
        ("total_received_eth", units(stats.total_received, ETH_DECIMALS)),
        ("tokens_sold", units(stats.tokens_sold, token_decimals)),
    ];

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Metric", "Value"]);
            for (metric, value) in rows {
                table.add_row(vec![Cell::new(metric), Cell::new(value)]);
            }
            table.to_string()
        }
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "checkpoint": stats.checkpoint,
            "total_purchases": stats.total_purchases,
            "unique_buyers": stats.unique_buyers,
            "earliest_block": stats.earliest_block,
            "latest_block": stats.latest_block,
            "total_received_wei": stats.total_received.to_string(),
            "tokens_sold_raw": stats.tokens_sold.to_string(),
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value"]);
            for (metric, value) in rows {
                let _ = wtr.write_record([metric, value.as_str()]);
            }
            finish_csv(wtr)
        }
    }
}

fn format_tx_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BUYER_A, tx_hash};

    fn record() -> PurchaseRecord {
        PurchaseRecord {
            transaction_hash: tx_hash(100, 0),
            log_index: 0,
            block_number: 100,
            buyer: BUYER_A,
            eth_amount: U256::from(100),
            token_amount: U256::from(100_000),
        }
    }

    #[test]
    fn parses_output_format() {
        assert!(matches!(OutputFormat::from("JSON"), OutputFormat::Json));
        assert!(matches!(OutputFormat::from("csv"), OutputFormat::Csv));
        assert!(matches!(OutputFormat::from("anything"), OutputFormat::Table));
    }

    #[test]
    fn purchases_json_keeps_raw_amounts() {
        let output = format_purchases(&[record()], 18, &OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value[0]["eth_wei"], "100");
        assert_eq!(value[0]["tokens_raw"], "100000");
        assert_eq!(value[0]["block_number"], 100);
    }

    #[test]
    fn purchases_csv_has_header_and_row() {
        let output = format_purchases(&[record()], 0, &OutputFormat::Csv);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("block_number,buyer"));
        assert!(lines[1].starts_with("100,"));
    }

    #[test]
    fn empty_tables_say_so() {
        assert_eq!(
            format_purchases(&[], 18, &OutputFormat::Table),
            "No purchases found."
        );
        assert_eq!(format_top_buyers(&[], 18, &OutputFormat::Table), "No buyers found.");
    }

    #[test]
    fn shortens_transaction_hashes() {
        let hash = format!("{:?}", tx_hash(1, 2));
        let short = format_tx_hash(&hash);
        assert_eq!(short.len(), 13);
        assert!(short.starts_with("0x0000"));
    }
}
