pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod deployment;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod ledger;
pub mod query;
pub mod repository;
pub mod rpc;
pub mod subscriber;

#[cfg(test)]
mod test_support;
