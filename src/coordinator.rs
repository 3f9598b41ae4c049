//! Reconciliation of historical catch-up and the live subscription.
//!
//! The coordinator is the single writer of the ledger and the checkpoint.
//! Events from both sources go through one path: decode, checkpoint gate,
//! dedup, pending batch. A batch only becomes durable, and only then visible
//! in the ledger, once every block it covers is known to be complete.

use crate::dedup::DedupIndex;
use crate::error::IngestError;
use crate::events::{DecodedPurchase, EventIdentity, FilterQuery, LogEntry, Source, decode_log};
use crate::fetcher::{CatchUpFetcher, ChainSource};
use crate::ledger::{AppliedPurchase, Ledger, LedgerCommit, LedgerReader};
use crate::repository::LedgerStore;
use crate::subscriber::{BlockHead, LiveFeed, LiveMessage, LiveSource};
use alloy_primitives::{Address, B256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Initializing,
    CatchingUp,
    Draining,
    Live,
    Reconnecting,
    Failed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Initializing => "Initializing",
            CoordinatorState::CatchingUp => "CatchingUp",
            CoordinatorState::Draining => "Draining",
            CoordinatorState::Live => "Live",
            CoordinatorState::Reconnecting => "Reconnecting",
            CoordinatorState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delays doubling from `initial_delay`, capped at `max_delay`. Never
    /// zero unless `max_delay` is.
    fn schedule(&self) -> ExponentialBackoff {
        let factor = (self.initial_delay.as_millis() / 2).max(1) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
    }

    fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(self.schedule().map(jitter))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub batch_size: u64,
    pub dedup_window: u64,
    /// Lowest block ever fetched, regardless of the checkpoint.
    pub start_block: u64,
    pub live_buffer_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            dedup_window: 128,
            start_block: 0,
            live_buffer_capacity: 4096,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub withdrawn: u64,
    pub reconnects: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied={} duplicates={} malformed={} withdrawn={} reconnects={}",
            self.applied, self.duplicates, self.malformed, self.withdrawn, self.reconnects
        )
    }
}

pub struct Coordinator<C, L, S> {
    chain: Arc<C>,
    live: L,
    store: S,
    ledger: Ledger,
    dedup: DedupIndex,
    filter: FilterQuery,
    settings: CoordinatorSettings,
    state: CoordinatorState,
    checkpoint: u64,
    /// Highest block known to have delivered all of its logs.
    complete_through: u64,
    pending: BTreeMap<EventIdentity, AppliedPurchase>,
    pending_hashes: BTreeMap<u64, B256>,
    feed: Option<LiveFeed>,
    buffered: Vec<LiveMessage>,
    feed_lost: Option<IngestError>,
    reconnect_attempts: u32,
    backoff: Box<dyn Iterator<Item = Duration> + Send>,
    stats: IngestStats,
}

impl<C, L, S> Coordinator<C, L, S>
where
    C: ChainSource,
    L: LiveSource,
    S: LedgerStore,
{
    pub fn new(
        chain: Arc<C>,
        live: L,
        store: S,
        contract_address: Address,
        settings: CoordinatorSettings,
    ) -> Self {
        Coordinator {
            chain,
            live,
            store,
            ledger: Ledger::new(),
            dedup: DedupIndex::new(settings.dedup_window),
            filter: FilterQuery::purchases(contract_address),
            backoff: settings.reconnect.backoff(),
            settings,
            state: CoordinatorState::Initializing,
            checkpoint: 0,
            complete_through: 0,
            pending: BTreeMap::new(),
            pending_hashes: BTreeMap::new(),
            feed: None,
            buffered: Vec::new(),
            feed_lost: None,
            reconnect_attempts: 0,
            stats: IngestStats::default(),
        }
    }

    pub fn reader(&self) -> LedgerReader {
        self.ledger.reader()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drives the state machine until a fatal error, which is returned.
    pub async fn run(&mut self) -> Result<(), IngestError> {
        loop {
            if self.step().await? == CoordinatorState::Failed {
                return Ok(());
            }
        }
    }

    /// Performs the work of the current state and moves to the next one.
    ///
    /// Transient errors lead to `Reconnecting`; fatal ones to `Failed`, in
    /// which case the error is returned. A failed coordinator does nothing.
    pub async fn step(&mut self) -> Result<CoordinatorState, IngestError> {
        let outcome = match self.state {
            CoordinatorState::Initializing => self.initialize(),
            CoordinatorState::CatchingUp => self.catch_up().await,
            CoordinatorState::Draining => self.drain(),
            CoordinatorState::Live => self.follow_live().await,
            CoordinatorState::Reconnecting => self.reconnect().await,
            CoordinatorState::Failed => return Ok(CoordinatorState::Failed),
        };

        match outcome {
            Ok(next) => {
                self.transition(next);
                Ok(next)
            }
            Err(e) if e.is_fatal() => {
                error!("Ingestion halted in state {}: {}", self.state, e);
                self.transition(CoordinatorState::Failed);
                Err(e)
            }
            Err(e) => {
                warn!("{} interrupted: {}", self.state, e);
                self.transition(CoordinatorState::Reconnecting);
                Ok(CoordinatorState::Reconnecting)
            }
        }
    }

    fn transition(&mut self, next: CoordinatorState) {
        if next != self.state {
            info!(
                "Coordinator {} -> {} at checkpoint {} ({})",
                self.state, next, self.checkpoint, self.stats
            );
            self.state = next;
        }
    }

    fn initialize(&mut self) -> Result<CoordinatorState, IngestError> {
        let snapshot = self.store.load_ledger()?;
        self.checkpoint = snapshot.checkpoint;
        self.complete_through = snapshot.checkpoint;
        info!(
            "Loaded checkpoint {} with {} buyers",
            snapshot.checkpoint,
            snapshot.balances.len()
        );
        self.ledger.restore(snapshot);
        Ok(CoordinatorState::CatchingUp)
    }

    async fn catch_up(&mut self) -> Result<CoordinatorState, IngestError> {
        // Subscribe before the tip is read so nothing mined meanwhile is missed.
        if self.feed.is_none() {
            let feed = self
                .live
                .subscribe(&self.filter, self.settings.live_buffer_capacity)
                .await?;
            debug!(
                "Live subscription {} (heads {:?})",
                feed.logs_subscription, feed.heads_subscription
            );
            self.feed = Some(feed);
        }

        self.verify_recorded_hash().await?;

        let chain = Arc::clone(&self.chain);
        let from_block = (self.checkpoint + 1).max(self.settings.start_block);
        let mut fetcher = CatchUpFetcher::start(
            chain.as_ref(),
            self.filter.clone(),
            from_block,
            self.settings.batch_size,
        )
        .await?;

        while let Some(page) = fetcher.next_page().await? {
            let to_block = page.to_block;
            for entry in &page.logs {
                if let Some(purchase) = self.decode(entry, Source::CatchUp) {
                    self.ingest(purchase, Source::CatchUp)?;
                }
            }
            if let Some(hash) = chain.block_hash(to_block).await? {
                if to_block > self.checkpoint {
                    self.pending_hashes.insert(to_block, hash);
                }
            }
            self.complete_through = self.complete_through.max(to_block);
            self.commit_through(to_block)?;
            self.buffer_live();
        }

        info!(
            "Catch-up reached tip {} with {} live messages buffered",
            fetcher.tip(),
            self.buffered.len()
        );
        Ok(CoordinatorState::Draining)
    }

    /// Replays what the subscription delivered during catch-up, in identity order.
    fn drain(&mut self) -> Result<CoordinatorState, IngestError> {
        self.buffer_live();

        let mut purchases = Vec::new();
        for message in std::mem::take(&mut self.buffered) {
            match message {
                LiveMessage::Log(entry) => {
                    if let Some(purchase) = self.decode(&entry, Source::Live) {
                        purchases.push(purchase);
                    }
                }
                LiveMessage::Head(head) => self.observe_head(&head),
                LiveMessage::Closed(e) => {
                    self.feed_lost.get_or_insert(e);
                }
            }
        }

        // Buffered logs for committed blocks that the node already retracted
        // belong to a fork catch-up never saw.
        let retracted: HashSet<(EventIdentity, Option<B256>)> = purchases
            .iter()
            .filter(|purchase| purchase.removed && purchase.identity.block_number <= self.checkpoint)
            .map(|purchase| (purchase.identity, purchase.block_hash))
            .collect();
        purchases.retain(|purchase| {
            purchase.removed || !retracted.contains(&(purchase.identity, purchase.block_hash))
        });

        // Stable, so a removal stays behind the log it retracts.
        purchases.sort_by_key(|purchase| purchase.identity);
        for purchase in purchases {
            self.observe_log(&purchase);
            self.ingest(purchase, Source::Live)?;
        }
        self.commit_through(self.complete_through)?;

        if let Some(e) = self.feed_lost.take() {
            return Err(e);
        }

        self.reconnect_attempts = 0;
        self.backoff = self.settings.reconnect.backoff();
        Ok(CoordinatorState::Live)
    }

    async fn follow_live(&mut self) -> Result<CoordinatorState, IngestError> {
        let feed = self
            .feed
            .as_mut()
            .ok_or_else(|| IngestError::SubscribeFailed("no live subscription".into()))?;

        let message = feed.recv().await;
        match message {
            Some(LiveMessage::Log(entry)) => {
                if let Some(purchase) = self.decode(&entry, Source::Live) {
                    self.observe_log(&purchase);
                    self.ingest(purchase, Source::Live)?;
                }
            }
            Some(LiveMessage::Head(head)) => {
                self.verify_head(&head)?;
                self.observe_head(&head);
            }
            Some(LiveMessage::Closed(e)) => return Err(e),
            None => return Err(IngestError::SubscribeFailed("live feed ended".into())),
        }

        self.commit_through(self.complete_through)?;
        Ok(CoordinatorState::Live)
    }

    /// Drops everything uncommitted and waits out the backoff. Catch-up then
    /// resumes from the checkpoint, so the gap is refetched whatever its length.
    async fn reconnect(&mut self) -> Result<CoordinatorState, IngestError> {
        self.feed = None;
        self.buffered.clear();
        self.feed_lost = None;

        if !self.pending.is_empty() {
            debug!("Discarding {} uncommitted purchases", self.pending.len());
        }
        self.pending.clear();
        self.pending_hashes.clear();
        self.dedup.discard_above(self.checkpoint);
        self.complete_through = self.checkpoint;

        self.reconnect_attempts += 1;
        self.stats.reconnects += 1;
        if let Some(max_attempts) = self.settings.reconnect.max_attempts {
            if self.reconnect_attempts > max_attempts {
                return Err(IngestError::ReconnectsExhausted(max_attempts));
            }
        }

        let delay = self
            .backoff
            .next()
            .unwrap_or(self.settings.reconnect.max_delay);
        warn!(
            "Reconnecting in {:?} (attempt {}), resuming after block {}",
            delay, self.reconnect_attempts, self.checkpoint
        );
        sleep(delay).await;
        Ok(CoordinatorState::CatchingUp)
    }

    /// Compares the newest recorded hash at or below the checkpoint with the chain.
    async fn verify_recorded_hash(&self) -> Result<(), IngestError> {
        let Some((block, recorded)) = self.store.recorded_block_hash(self.checkpoint)? else {
            return Ok(());
        };

        match self.chain.block_hash(block).await? {
            Some(observed) if observed != recorded => Err(IngestError::ReorgDetected {
                block,
                recorded,
                observed,
            }),
            Some(_) => Ok(()),
            None => Err(IngestError::FetchFailed(format!(
                "node does not have checkpointed block {block}"
            ))),
        }
    }

    /// Hash recorded for exactly `block`, if any.
    fn committed_hash(&self, block: u64) -> Result<Option<B256>, IngestError> {
        Ok(self
            .store
            .recorded_block_hash(block)?
            .filter(|(recorded_block, _)| *recorded_block == block)
            .map(|(_, hash)| hash))
    }

    /// A committed block showing up with another hash was replaced on chain.
    fn verify_committed_hash(&self, block: u64, observed: B256) -> Result<(), IngestError> {
        match self.committed_hash(block)? {
            Some(recorded) if recorded != observed => Err(IngestError::ReorgDetected {
                block,
                recorded,
                observed,
            }),
            _ => Ok(()),
        }
    }

    /// Checks a head announced live against what is committed at its height
    /// and at its parent's.
    fn verify_head(&self, head: &BlockHead) -> Result<(), IngestError> {
        if let Some(hash) = head.hash {
            if head.number <= self.checkpoint {
                self.verify_committed_hash(head.number, hash)?;
            }
        }
        if let Some(parent_hash) = head.parent_hash {
            let parent = head.number.saturating_sub(1);
            if head.number > 0 && parent <= self.checkpoint {
                self.verify_committed_hash(parent, parent_hash)?;
            }
        }
        Ok(())
    }

    fn buffer_live(&mut self) {
        let Some(feed) = self.feed.as_mut() else {
            return;
        };

        while self.feed_lost.is_none() && self.buffered.len() < self.settings.live_buffer_capacity {
            match feed.try_recv() {
                Ok(LiveMessage::Closed(e)) => self.feed_lost = Some(e),
                Ok(message) => self.buffered.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.feed_lost = Some(IngestError::SubscribeFailed("live feed ended".into()))
                }
            }
        }
    }

    fn decode(&mut self, entry: &LogEntry, source: Source) -> Option<DecodedPurchase> {
        match decode_log(entry) {
            Ok(purchase) => Some(purchase),
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    "Skipping {:?} log in tx {}: {}",
                    source,
                    entry.transaction_hash.as_deref().unwrap_or("<unknown>"),
                    IngestError::from(e)
                );
                None
            }
        }
    }

    /// Logs arrive in chain order, so a log of block `n` completes `n - 1`.
    fn observe_log(&mut self, purchase: &DecodedPurchase) {
        if !purchase.removed {
            let previous = purchase.identity.block_number.saturating_sub(1);
            self.complete_through = self.complete_through.max(previous);
        }
    }

    fn observe_head(&mut self, head: &BlockHead) {
        let previous = head.number.saturating_sub(1);
        if let Some(parent_hash) = head.parent_hash {
            if previous > self.checkpoint {
                self.pending_hashes.insert(previous, parent_hash);
            }
        }
        if let Some(hash) = head.hash {
            if head.number > self.checkpoint {
                self.pending_hashes.insert(head.number, hash);
            }
        }
        self.complete_through = self.complete_through.max(previous);
    }

    fn ingest(&mut self, purchase: DecodedPurchase, source: Source) -> Result<(), IngestError> {
        let identity = purchase.identity;
        let block = identity.block_number;

        if purchase.removed {
            if block <= self.checkpoint {
                let recorded = self.committed_hash(block)?;
                match (recorded, purchase.block_hash) {
                    (Some(recorded), Some(observed)) if recorded != observed => {
                        debug!("Ignoring removal of {} from a block never applied", identity);
                    }
                    (recorded, observed) => {
                        return Err(IngestError::ReorgDetected {
                            block,
                            recorded: recorded.unwrap_or_default(),
                            observed: observed.unwrap_or_default(),
                        });
                    }
                }
                return Ok(());
            }
            if self.pending.remove(&identity).is_some() {
                self.dedup.retract(&identity);
                self.pending_hashes.remove(&block);
                self.stats.withdrawn += 1;
                info!("Withdrew purchase {} removed by the node", identity);
            }
            return Ok(());
        }

        if block <= self.checkpoint {
            if let Some(observed) = purchase.block_hash {
                self.verify_committed_hash(block, observed)?;
            }
            self.stats.duplicates += 1;
            debug!("Dropping duplicate {:?} purchase {}", source, identity);
            return Ok(());
        }

        if !self.dedup.accept(identity) {
            self.stats.duplicates += 1;
            debug!("Dropping duplicate {:?} purchase {}", source, identity);
            return Ok(());
        }

        if let Some(hash) = purchase.block_hash {
            self.pending_hashes.insert(block, hash);
        }
        self.pending.insert(
            identity,
            AppliedPurchase {
                identity,
                buyer: purchase.buyer,
                event: purchase.event,
                source,
            },
        );
        Ok(())
    }

    /// Persists every pending purchase up to `block` and moves the checkpoint
    /// there, then applies the same batch to the ledger.
    fn commit_through(&mut self, block: u64) -> Result<(), IngestError> {
        if block <= self.checkpoint {
            return Ok(());
        }

        let later = self.pending.split_off(&EventIdentity::block_start(block + 1));
        let purchases: Vec<AppliedPurchase> =
            std::mem::replace(&mut self.pending, later).into_values().collect();
        let later_hashes = self.pending_hashes.split_off(&(block + 1));
        let block_hashes = std::mem::replace(&mut self.pending_hashes, later_hashes)
            .into_iter()
            .collect();

        let commit = LedgerCommit {
            previous_checkpoint: self.checkpoint,
            checkpoint: block,
            purchases,
            block_hashes,
        };
        self.store.commit(&commit)?;
        self.ledger.apply_commit(&commit);

        self.checkpoint = block;
        self.dedup.advance(block);
        self.stats.applied += commit.purchases.len() as u64;

        if !commit.purchases.is_empty() {
            info!(
                "Applied {} purchases, checkpoint now {}",
                commit.purchases.len(),
                block
            );
        }
        Ok(())
    }
}
