//! In-memory balance ledger.
//!
//! The coordinator is the only writer. Readers (the serving side) hold a
//! [`LedgerReader`] and see state as of a committed checkpoint: a commit is
//! applied under a single write lock, so a snapshot never observes half a batch.

use crate::events::{EventIdentity, PurchaseEvent, Source};
use alloy_primitives::{Address, B256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub eth_amount: U256,
    pub token_amount: U256,
    pub purchases: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaleTotals {
    pub total_received: U256,
    pub tokens_sold: U256,
    pub purchases: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPurchase {
    pub identity: EventIdentity,
    pub buyer: Address,
    pub event: PurchaseEvent,
    pub source: Source,
}

/// Everything that becomes durable together: the purchases of one or more
/// complete blocks and the checkpoint that covers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommit {
    pub previous_checkpoint: u64,
    pub checkpoint: u64,
    pub purchases: Vec<AppliedPurchase>,
    pub block_hashes: Vec<(u64, B256)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub checkpoint: u64,
    pub balances: HashMap<Address, Balance>,
    pub totals: SaleTotals,
}

#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub checkpoint: u64,
    pub purchases: Vec<AppliedPurchase>,
    pub totals: SaleTotals,
}

type SharedState = Arc<RwLock<LedgerSnapshot>>;

fn read(state: &SharedState) -> RwLockReadGuard<'_, LedgerSnapshot> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(state: &SharedState) -> RwLockWriteGuard<'_, LedgerSnapshot> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct Ledger {
    state: SharedState,
    updates: broadcast::Sender<LedgerUpdate>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::from_snapshot(LedgerSnapshot::default())
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(snapshot)),
            updates,
        }
    }

    /// Replaces the whole state, used when restoring from the store.
    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        *write(&self.state) = snapshot;
    }

    pub fn reader(&self) -> LedgerReader {
        LedgerReader {
            state: Arc::clone(&self.state),
            updates: self.updates.clone(),
        }
    }

    /// Adds one purchase to `address`. Callers guarantee the purchase is unique.
    pub fn apply(&mut self, address: Address, eth_amount: U256, token_amount: U256) {
        let mut state = write(&self.state);
        add_purchase(&mut state, address, eth_amount, token_amount);
    }

    /// Applies a durable commit and publishes it to subscribers.
    pub fn apply_commit(&mut self, commit: &LedgerCommit) {
        let totals = {
            let mut state = write(&self.state);
            for purchase in &commit.purchases {
                add_purchase(
                    &mut state,
                    purchase.buyer,
                    purchase.event.eth_amount,
                    purchase.event.token_amount,
                );
            }
            state.checkpoint = state.checkpoint.max(commit.checkpoint);
            state.totals
        };

        // Nobody listening is fine.
        let _ = self.updates.send(LedgerUpdate {
            checkpoint: commit.checkpoint,
            purchases: commit.purchases.clone(),
            totals,
        });
    }

    pub fn get(&self, address: &Address) -> Balance {
        self.reader().get_balance(address)
    }

    pub fn checkpoint(&self) -> u64 {
        read(&self.state).checkpoint
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// Commits reach the ledger only after the store accepted the same sums with
/// checked arithmetic, so saturation is unreachable on the ingestion path.
fn add_purchase(
    state: &mut LedgerSnapshot,
    address: Address,
    eth_amount: U256,
    token_amount: U256,
) {
    let balance = state.balances.entry(address).or_default();
    balance.eth_amount = balance.eth_amount.saturating_add(eth_amount);
    balance.token_amount = balance.token_amount.saturating_add(token_amount);
    balance.purchases += 1;

    let totals = &mut state.totals;
    totals.total_received = totals.total_received.saturating_add(eth_amount);
    totals.tokens_sold = totals.tokens_sold.saturating_add(token_amount);
    totals.purchases += 1;
}

/// Read-only view handed to consumers outside the ingestion task.
#[derive(Clone)]
pub struct LedgerReader {
    state: SharedState,
    updates: broadcast::Sender<LedgerUpdate>,
}

impl LedgerReader {
    /// Zero for addresses that never purchased.
    pub fn get_balance(&self, address: &Address) -> Balance {
        read(&self.state)
            .balances
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        read(&self.state).clone()
    }

    pub fn totals(&self) -> SaleTotals {
        read(&self.state).totals
    }

    pub fn checkpoint(&self) -> u64 {
        read(&self.state).checkpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerUpdate> {
        self.updates.subscribe()
    }
}
