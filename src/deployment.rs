use crate::config::StartBlock;
use crate::rpc::RpcClient;
use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait CodeLookup: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64>;

    async fn has_code_at(&self, address: Address, block_number: u64) -> Result<bool>;
}

#[async_trait]
impl CodeLookup for RpcClient {
    async fn latest_block_number(&self) -> Result<u64> {
        self.get_latest_block().await
    }

    async fn has_code_at(&self, address: Address, block_number: u64) -> Result<bool> {
        Ok(!self.get_code_at_block(address, block_number).await?.is_empty())
    }
}

/// First block at which `address` has code, by binary search up to `latest_block`.
pub async fn find_deployment_block<C: CodeLookup + ?Sized>(
    client: &C,
    address: Address,
    latest_block: u64,
) -> Result<u64> {
    info!("Searching for deployment block of contract {:?}", address);

    if !client.has_code_at(address, latest_block).await? {
        anyhow::bail!("Address {:?} is not a deployed contract", address);
    }

    let mut left = 0u64;
    let mut right = latest_block;

    while left < right {
        let mid = left + (right - left) / 2;

        if client.has_code_at(address, mid).await? {
            right = mid;
        } else {
            left = mid + 1;
        }
    }

    info!("Contract deployed at block {}", left);
    Ok(left)
}

/// Lowest block catch-up may start from. The deployment search only runs
/// for a fresh store, since a checkpoint already places the cursor past it.
pub async fn resolve_start_block<C: CodeLookup + ?Sized>(
    client: &C,
    address: Address,
    start_block: StartBlock,
    checkpoint: u64,
) -> Result<u64> {
    match start_block {
        StartBlock::Genesis => Ok(0),
        StartBlock::Number(block) => Ok(block),
        StartBlock::Deployment if checkpoint > 0 => {
            info!("Checkpoint {} exists, skipping deployment search", checkpoint);
            Ok(0)
        }
        StartBlock::Deployment => {
            let latest_block = client.latest_block_number().await?;
            find_deployment_block(client, address, latest_block).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CONTRACT;
    use std::sync::Mutex;

    struct DeployedAt {
        block: Option<u64>,
        latest: u64,
        lookups: Mutex<u32>,
    }

    impl DeployedAt {
        fn new(block: Option<u64>, latest: u64) -> Self {
            Self {
                block,
                latest,
                lookups: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl CodeLookup for DeployedAt {
        async fn latest_block_number(&self) -> Result<u64> {
            Ok(self.latest)
        }

        async fn has_code_at(&self, _address: Address, block_number: u64) -> Result<bool> {
            *self.lookups.lock().unwrap() += 1;
            Ok(self.block.is_some_and(|deployed| block_number >= deployed))
        }
    }

    #[tokio::test]
    async fn finds_first_block_with_code() {
        let chain = DeployedAt::new(Some(1_234_567), 20_000_000);
        assert_eq!(
            find_deployment_block(&chain, CONTRACT, 20_000_000).await.unwrap(),
            1_234_567
        );
        assert!(*chain.lookups.lock().unwrap() < 40);
    }

    #[tokio::test]
    async fn rejects_address_without_code() {
        let chain = DeployedAt::new(None, 100);
        assert!(find_deployment_block(&chain, CONTRACT, 100).await.is_err());
    }

    #[tokio::test]
    async fn resolves_configured_start() {
        let chain = DeployedAt::new(Some(40), 100);
        let resolve = |start| resolve_start_block(&chain, CONTRACT, start, 0);

        assert_eq!(resolve(StartBlock::Genesis).await.unwrap(), 0);
        assert_eq!(resolve(StartBlock::Number(77)).await.unwrap(), 77);
        assert_eq!(resolve(StartBlock::Deployment).await.unwrap(), 40);

        *chain.lookups.lock().unwrap() = 0;
        let resumed = resolve_start_block(&chain, CONTRACT, StartBlock::Deployment, 90);
        assert_eq!(resumed.await.unwrap(), 0);
        assert_eq!(*chain.lookups.lock().unwrap(), 0);
    }
}
