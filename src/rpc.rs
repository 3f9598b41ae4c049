use crate::error::IngestError;
use crate::events::{FilterQuery, LogEntry};
use crate::fetcher::{ChainSource, FetchError};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Log};
use alloy::transports::{TransportError, TransportResult};
use alloy_primitives::{Address, B256, Bytes};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120); // 2 minutes timeout per request

/// JSON-RPC client over one or more HTTP endpoints, rotating on failure.
#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String], max_retries: usize) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    /// Exponential delays doubling from 100ms, capped at 10s, jittered.
    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error_str: &str) {
        let current_url = self.get_current_url();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self) -> anyhow::Error {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            current_url
        );
        self.rotate_provider();
        anyhow::anyhow!(
            "Request timeout after {} seconds",
            REQUEST_TIMEOUT.as_secs()
        )
    }

    /// Runs `request` against the current endpoint under the retry policy,
    /// rotating to the next endpoint after every failure or timeout.
    async fn request<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(AlloyFullProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let request = &request;
        Retry::spawn(self.get_retry_strategy(), move || async move {
            match timeout(REQUEST_TIMEOUT, request(self.get_provider().clone())).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    let error_str = e.to_string();
                    self.handle_error(&error_str);
                    Err(anyhow::anyhow!("{}", error_str))
                }
                Err(_) => Err(self.handle_timeout()),
            }
        })
        .await
    }

    pub async fn get_latest_block(&self) -> Result<u64> {
        self.request(|provider| async move { provider.get_block_number().await })
            .await
    }

    pub async fn get_code_at_block(&self, address: Address, block_number: u64) -> Result<Bytes> {
        self.request(|provider| async move {
            provider
                .get_code_at(address)
                .block_id(BlockNumberOrTag::Number(block_number).into())
                .await
        })
        .await
    }

    pub async fn get_block_hash(&self, block_number: u64) -> Result<Option<B256>> {
        self.request(|provider| async move {
            let block = provider
                .get_block_by_number(BlockNumberOrTag::Number(block_number))
                .await?;
            Ok::<_, TransportError>(block.map(|block| block.header.hash))
        })
        .await
    }

    /// One bounded `eth_getLogs` call. A result-count rejection is returned
    /// as `Ok(Err(..))` so it is not retried against the same range.
    async fn get_logs_internal(
        &self,
        query: &FilterQuery,
    ) -> Result<std::result::Result<Vec<Log>, FetchError>> {
        let filter = query.to_filter();
        self.request(|provider| {
            let filter = filter.clone();
            async move {
                match provider.get_logs(&filter).await {
                    Ok(logs) => Ok(Ok(logs)),
                    Err(e) if Self::is_result_cap(&e) => {
                        let error_str = e.to_string();
                        debug!("Max results exceeded: {}", error_str);
                        Ok(Err(FetchError::TooManyResults {
                            suggested_to: Self::parse_max_results_error(&error_str),
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await
    }

    fn is_result_cap(error: &TransportError) -> bool {
        let error_str = error.to_string();
        error_str.contains("exceeds max results") || error_str.contains("query returned more than")
    }

    /// End of the range suggested by `retry with the range A-B` style errors.
    fn parse_max_results_error(error_str: &str) -> Option<u64> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;
        captures.get(2)?.as_str().parse().ok()
    }
}

#[async_trait]
impl ChainSource for RpcClient {
    async fn latest_block(&self) -> std::result::Result<u64, IngestError> {
        self.get_latest_block()
            .await
            .map_err(|e| IngestError::FetchFailed(e.to_string()))
    }

    async fn logs(&self, query: &FilterQuery) -> std::result::Result<Vec<LogEntry>, FetchError> {
        let logs = self
            .get_logs_internal(query)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))??;
        Ok(logs.iter().map(LogEntry::from).collect())
    }

    async fn block_hash(&self, block: u64) -> std::result::Result<Option<B256>, IngestError> {
        self.get_block_hash(block)
            .await
            .map_err(|e| IngestError::FetchFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suggested_range_end() {
        let error = "query exceeds max results 20000, retry with the range 24383075-24383084";
        assert_eq!(RpcClient::parse_max_results_error(error), Some(24383084));
        assert_eq!(RpcClient::parse_max_results_error("exceeds max results"), None);
    }

    #[test]
    fn rejects_empty_url_list() {
        assert!(RpcClient::new(&[], 3).is_err());
        assert!(RpcClient::new(&["not a url".to_string()], 3).is_err());
    }

    #[test]
    fn rotates_between_endpoints() {
        let urls = vec![
            "http://localhost:8545".to_string(),
            "http://localhost:8546".to_string(),
        ];
        let client = RpcClient::new(&urls, 1).unwrap();
        assert_eq!(client.get_current_url(), "http://localhost:8545");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8546");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://localhost:8545");
    }
}
