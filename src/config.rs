use crate::coordinator::{CoordinatorSettings, ReconnectPolicy};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Where the first catch-up begins when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlock {
    Genesis,
    Number(u64),
    /// Located by searching for the block that first has contract code.
    Deployment,
}

impl FromStr for StartBlock {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "genesis" | "earliest" => Ok(StartBlock::Genesis),
            "deployment" => Ok(StartBlock::Deployment),
            other => other
                .parse()
                .map(StartBlock::Number)
                .with_context(|| format!("Invalid START_BLOCK '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub ws_rpc_url: String,
    pub contract_address: Address,
    pub database_url: String,
    pub start_block: StartBlock,
    pub batch_size: u64,
    pub dedup_window: u64,
    pub live_buffer_capacity: usize,
    pub rpc_max_retries: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub token_decimals: u8,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {name} '{value}': {e}")),
        _ => Ok(default),
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let raw_urls = std::env::var("JSON_RPC_URLS")
            .or_else(|_| std::env::var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS (or JSON_RPC_URL) must be set in .env")?;
        let json_rpc_urls = split_urls(&raw_urls);
        if json_rpc_urls.is_empty() {
            anyhow::bail!("JSON_RPC_URLS does not contain any URL");
        }

        let ws_rpc_url = std::env::var("WS_RPC_URL").context("WS_RPC_URL must be set in .env")?;

        let contract_address_str = std::env::var("CONTRACT_ADDRESS")
            .context("CONTRACT_ADDRESS must be set in .env")?;
        let contract_address = Address::from_str(contract_address_str.trim())
            .context("Invalid CONTRACT_ADDRESS format")?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:./tracker.db".to_string());

        Ok(Config {
            json_rpc_urls,
            ws_rpc_url,
            contract_address,
            database_url,
            start_block: env_or("START_BLOCK", StartBlock::Genesis)?,
            batch_size: env_or("BATCH_SIZE", 1000)?,
            dedup_window: env_or("DEDUP_WINDOW", 128)?,
            live_buffer_capacity: env_or("LIVE_BUFFER_CAPACITY", 4096)?,
            rpc_max_retries: env_or("RPC_MAX_RETRIES", 5)?,
            reconnect_initial_ms: env_or("RECONNECT_INITIAL_MS", 500)?,
            reconnect_max_ms: env_or("RECONNECT_MAX_MS", 15_000)?,
            reconnect_max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", 0)?,
            token_decimals: env_or("TOKEN_DECIMALS", 18)?,
        })
    }

    /// Database location for tools that need nothing else from the environment.
    pub fn database_url_from_env() -> String {
        dotenv::dotenv().ok();
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./tracker.db".to_string())
    }

    /// `start_block` is the resolved height; deployment search happens before this.
    pub fn coordinator_settings(&self, start_block: u64) -> CoordinatorSettings {
        CoordinatorSettings {
            batch_size: self.batch_size.max(1),
            dedup_window: self.dedup_window.max(1),
            start_block,
            live_buffer_capacity: self.live_buffer_capacity.max(1),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
                max_attempts: (self.reconnect_max_attempts > 0).then_some(self.reconnect_max_attempts),
            },
        }
    }
}
