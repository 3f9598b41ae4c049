use crate::error::IngestError;
use crate::events::{FilterQuery, LogEntry};
use alloy_primitives::B256;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("node returned too many results for the range")]
    TooManyResults { suggested_to: Option<u64> },

    #[error("{0}")]
    Transport(String),
}

/// Historical access to the node.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn latest_block(&self) -> Result<u64, IngestError>;

    /// Logs matching a bounded `query`, in chain order.
    async fn logs(&self, query: &FilterQuery) -> Result<Vec<LogEntry>, FetchError>;

    /// Canonical hash at `block`, `None` if the node does not have it.
    async fn block_hash(&self, block: u64) -> Result<Option<B256>, IngestError>;
}

/// One contiguous block range fully fetched from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpPage {
    pub from_block: u64,
    pub to_block: u64,
    pub tip: u64,
    pub logs: Vec<LogEntry>,
}

/// Walks `[from, tip]` in ascending, gapless pages.
///
/// The tip is resolved once when the fetcher starts; anything mined after
/// that is left to the live subscription.
pub struct CatchUpFetcher<'a, C: ChainSource + ?Sized> {
    chain: &'a C,
    filter: FilterQuery,
    batch_size: u64,
    next_block: u64,
    tip: u64,
}

impl<'a, C: ChainSource + ?Sized> CatchUpFetcher<'a, C> {
    pub async fn start(
        chain: &'a C,
        filter: FilterQuery,
        from_block: u64,
        batch_size: u64,
    ) -> Result<Self, IngestError> {
        let tip = chain.latest_block().await?;
        info!("Catching up from block {} to tip {}", from_block, tip);
        Ok(Self {
            chain,
            filter,
            batch_size: batch_size.max(1),
            next_block: from_block,
            tip,
        })
    }

    pub fn tip(&self) -> u64 {
        self.tip
    }

    pub fn is_done(&self) -> bool {
        self.next_block > self.tip
    }

    /// Next page, or `None` once the tip has been reached.
    ///
    /// A failed page leaves the cursor where it was, so calling again retries
    /// the same range.
    pub async fn next_page(&mut self) -> Result<Option<CatchUpPage>, IngestError> {
        if self.is_done() {
            return Ok(None);
        }

        let from = self.next_block;
        let to = from.saturating_add(self.batch_size - 1).min(self.tip);
        let logs = self.fetch_range(from, to).await?;
        self.next_block = to + 1;

        debug!("Fetched {} logs for blocks {} to {}", logs.len(), from, to);

        Ok(Some(CatchUpPage {
            from_block: from,
            to_block: to,
            tip: self.tip,
            logs,
        }))
    }

    /// All logs in `[from, to]`, splitting the range whenever the node caps
    /// the result count.
    async fn fetch_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, IngestError> {
        let mut all_logs = Vec::new();
        let mut current_from = from;

        while current_from <= to {
            let mut current_to = to;
            loop {
                let query = self.filter.range(current_from, current_to);
                match self.chain.logs(&query).await {
                    Ok(logs) => {
                        all_logs.extend(logs);
                        break;
                    }
                    Err(FetchError::TooManyResults { suggested_to }) => {
                        if current_to == current_from {
                            return Err(IngestError::FetchFailed(format!(
                                "block {current_from} alone exceeds the node's result limit"
                            )));
                        }
                        let split = suggested_to
                            .filter(|s| *s >= current_from && *s < current_to)
                            .unwrap_or(current_from + (current_to - current_from) / 2);
                        info!(
                            "Hit max results limit for blocks {}-{}, splitting at block {}",
                            current_from, current_to, split
                        );
                        current_to = split;
                    }
                    Err(FetchError::Transport(e)) => return Err(IngestError::FetchFailed(e)),
                }
            }
            current_from = current_to + 1;
        }

        Ok(all_logs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{BlockTag, parse_quantity};
    use crate::test_support::{BUYER_A, CONTRACT, block_hash, purchase_log};
    use std::sync::Mutex;

    /// In-process node: a fixed set of logs, an optional per-query result cap
    /// and a queue of injected transport failures.
    pub(crate) struct FakeChain {
        pub logs: Mutex<Vec<LogEntry>>,
        pub tip: Mutex<u64>,
        pub max_results: Option<usize>,
        pub failures: Mutex<u32>,
        pub hashes: Mutex<std::collections::HashMap<u64, B256>>,
        pub queries: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeChain {
        pub(crate) fn new(logs: Vec<LogEntry>, tip: u64) -> Self {
            Self {
                logs: Mutex::new(logs),
                tip: Mutex::new(tip),
                max_results: None,
                failures: Mutex::new(0),
                hashes: Mutex::new(std::collections::HashMap::new()),
                queries: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn set_tip(&self, tip: u64) {
            *self.tip.lock().unwrap() = tip;
        }

        pub(crate) fn push_logs(&self, logs: Vec<LogEntry>) {
            self.logs.lock().unwrap().extend(logs);
        }
    }

    fn block_of(log: &LogEntry) -> u64 {
        parse_quantity("blockNumber", log.block_number.as_deref()).unwrap()
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn latest_block(&self) -> Result<u64, IngestError> {
            Ok(*self.tip.lock().unwrap())
        }

        async fn logs(&self, query: &FilterQuery) -> Result<Vec<LogEntry>, FetchError> {
            let (BlockTag::Number(from), BlockTag::Number(to)) = (query.from_block, query.to_block)
            else {
                panic!("fetcher must send bounded ranges");
            };
            self.queries.lock().unwrap().push((from, to));

            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(FetchError::Transport("connection reset".into()));
                }
            }

            let logs: Vec<LogEntry> = self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| (from..=to).contains(&block_of(log)))
                .cloned()
                .collect();

            match self.max_results {
                Some(max) if logs.len() > max => Err(FetchError::TooManyResults { suggested_to: None }),
                _ => Ok(logs),
            }
        }

        async fn block_hash(&self, block: u64) -> Result<Option<B256>, IngestError> {
            if block > *self.tip.lock().unwrap() {
                return Ok(None);
            }
            Ok(Some(
                self.hashes
                    .lock()
                    .unwrap()
                    .get(&block)
                    .copied()
                    .unwrap_or_else(|| block_hash(block)),
            ))
        }
    }

    async fn drain(fetcher: &mut CatchUpFetcher<'_, FakeChain>) -> Vec<CatchUpPage> {
        let mut pages = Vec::new();
        while let Some(page) = fetcher.next_page().await.unwrap() {
            pages.push(page);
        }
        pages
    }

    #[tokio::test]
    async fn pages_are_contiguous_up_to_tip() {
        let logs = (1..=25).map(|b| purchase_log(b, 0, BUYER_A, 1, 1)).collect();
        let chain = FakeChain::new(logs, 25);
        let mut fetcher = CatchUpFetcher::start(&chain, FilterQuery::purchases(CONTRACT), 3, 10)
            .await
            .unwrap();

        let pages = drain(&mut fetcher).await;
        let bounds: Vec<_> = pages.iter().map(|p| (p.from_block, p.to_block)).collect();
        assert_eq!(bounds, vec![(3, 12), (13, 22), (23, 25)]);
        assert!(pages.iter().all(|p| p.tip == 25));
        assert_eq!(pages.iter().map(|p| p.logs.len()).sum::<usize>(), 23);
        assert!(fetcher.is_done());
    }

    #[tokio::test]
    async fn splits_ranges_over_result_limit() {
        let logs = (1..=8)
            .flat_map(|b| (0..2).map(move |i| purchase_log(b, i, BUYER_A, 1, 1)))
            .collect();
        let mut chain = FakeChain::new(logs, 8);
        chain.max_results = Some(4);

        let mut fetcher = CatchUpFetcher::start(&chain, FilterQuery::purchases(CONTRACT), 1, 100)
            .await
            .unwrap();
        let pages = drain(&mut fetcher).await;

        assert_eq!(pages.len(), 1);
        let blocks: Vec<u64> = pages[0].logs.iter().map(block_of).collect();
        let mut sorted = blocks.clone();
        sorted.sort();
        assert_eq!(blocks, sorted);
        assert_eq!(blocks.len(), 16);
    }

    #[tokio::test]
    async fn single_block_over_limit_fails() {
        let logs = (0..3).map(|i| purchase_log(4, i, BUYER_A, 1, 1)).collect();
        let mut chain = FakeChain::new(logs, 4);
        chain.max_results = Some(2);

        let mut fetcher = CatchUpFetcher::start(&chain, FilterQuery::purchases(CONTRACT), 4, 10)
            .await
            .unwrap();
        assert!(matches!(
            fetcher.next_page().await,
            Err(IngestError::FetchFailed(_))
        ));
    }

    #[tokio::test]
    async fn failed_page_is_retried_from_same_block() {
        let logs = (1..=4).map(|b| purchase_log(b, 0, BUYER_A, 1, 1)).collect();
        let chain = FakeChain::new(logs, 4);
        *chain.failures.lock().unwrap() = 1;

        let mut fetcher = CatchUpFetcher::start(&chain, FilterQuery::purchases(CONTRACT), 1, 2)
            .await
            .unwrap();
        assert!(fetcher.next_page().await.is_err());

        let page = fetcher.next_page().await.unwrap().unwrap();
        assert_eq!((page.from_block, page.to_block), (1, 2));
        assert_eq!(page.logs.len(), 2);
    }

    #[tokio::test]
    async fn nothing_to_fetch_when_checkpoint_is_at_tip() {
        let chain = FakeChain::new(vec![], 10);
        let mut fetcher = CatchUpFetcher::start(&chain, FilterQuery::purchases(CONTRACT), 11, 10)
            .await
            .unwrap();
        assert!(fetcher.next_page().await.unwrap().is_none());
        assert!(chain.queries.lock().unwrap().is_empty());
    }
}
