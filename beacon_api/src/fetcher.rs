use core::{future::Future, time::Duration};
use std::{sync::Arc, time::Instant};

use anyhow::{bail, ensure, Result};
use log::{info, warn};
use request_book::RequestBook;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use types::{
    config::Config,
    containers::{
        BlockRewards, Eth1Deposit, NormalizedBlock, NormalizedState, ProposerDuty, Transaction,
    },
    primitives::{Epoch, ExecutionBlockNumber, Slot, UnixSeconds, H256},
};

use crate::{
    ids::{BlockId, StateId},
    node::{BeaconNode, EventStream, ExecutionNode, NodeError},
};

#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub state_book_size: usize,
    pub block_book_size: usize,
    pub transaction_book_size: usize,
}

/// Returned when a transient failure persists through every allowed attempt.
#[derive(Debug, Error)]
#[error("{resource} unavailable after {attempts} attempts: {last_error}")]
pub struct SlotUnavailable {
    pub resource: String,
    pub attempts: u32,
    pub last_error: String,
}

/// The last slot of the latest finalized epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FinalizedEndSlot {
    pub epoch: Epoch,
    pub slot: Slot,
    pub state_root: H256,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ActiveRequests {
    pub states: usize,
    pub blocks: usize,
    pub transactions: usize,
}

pub struct Fetcher {
    config: Arc<Config>,
    beacon_node: Arc<dyn BeaconNode>,
    execution_node: Option<Arc<dyn ExecutionNode>>,
    state_book: RequestBook,
    block_book: RequestBook,
    transaction_book: RequestBook,
    max_retries: u32,
    retry_interval: Duration,
    cancellation: CancellationToken,
}

impl Fetcher {
    pub fn new(
        config: Arc<Config>,
        beacon_node: Arc<dyn BeaconNode>,
        execution_node: Option<Arc<dyn ExecutionNode>>,
        options: Options,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let Options {
            max_retries,
            retry_interval,
            state_book_size,
            block_book_size,
            transaction_book_size,
        } = options;

        ensure!(max_retries > 0, Error::ZeroRetries);

        Ok(Self {
            config,
            beacon_node,
            execution_node,
            state_book: RequestBook::new("states", state_book_size)?,
            block_book: RequestBook::new("blocks", block_book_size)?,
            transaction_book: RequestBook::new("transactions", transaction_book_size)?,
            max_retries,
            retry_interval,
            cancellation,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub const fn has_execution_node(&self) -> bool {
        self.execution_node.is_some()
    }

    #[must_use]
    pub fn active_requests(&self) -> ActiveRequests {
        ActiveRequests {
            states: self.state_book.active_pages(),
            blocks: self.block_book.active_pages(),
            transactions: self.transaction_book.active_pages(),
        }
    }

    pub async fn request_genesis_time(&self) -> Result<UnixSeconds> {
        let beacon_node = self.beacon_node.as_ref();
        self.retry("genesis", || beacon_node.genesis_time()).await
    }

    pub async fn request_state(&self, slot: Slot) -> Result<NormalizedState> {
        self.request_state_with_root(slot, StateId::Slot(slot), None)
            .await
    }

    /// Resolves the state by root rather than by slot.
    ///
    /// Some nodes announce a new head before their canonical head pointer moves,
    /// so a lookup by slot right after the announcement may return the previous state.
    pub async fn request_state_by_root(&self, slot: Slot, root: H256) -> Result<NormalizedState> {
        self.request_state_with_root(slot, StateId::Root(root), Some(root))
            .await
    }

    pub async fn request_state_root(&self, slot: Slot) -> Result<H256> {
        let _page = self.state_book.acquire(format!("state_root={slot}")).await?;
        self.fetch_state_root(slot).await
    }

    /// Returns `None` until the chain has finalized an epoch after genesis.
    pub async fn request_finalized_checkpoint(&self) -> Result<Option<FinalizedEndSlot>> {
        let resource = "finality=head";
        let beacon_node = self.beacon_node.as_ref();

        let finality = {
            let _page = self.state_book.acquire(resource).await?;

            self.retry(resource, || beacon_node.finality(StateId::Head))
                .await?
        };

        let epoch = finality.finalized.epoch;

        let Some(slot) = helper_functions::misc::finalized_end_slot(&self.config, epoch) else {
            return Ok(None);
        };

        let state_root = self.request_state_root(slot).await?;

        Ok(Some(FinalizedEndSlot {
            epoch,
            slot,
            state_root,
        }))
    }

    pub async fn request_block_rewards(&self, slot: Slot) -> Result<Option<BlockRewards>> {
        let resource = format!("block_rewards={slot}");
        let _page = self.block_book.acquire(resource.as_str()).await?;
        let beacon_node = self.beacon_node.as_ref();

        self.retry(&resource, || beacon_node.block_rewards(slot))
            .await
    }

    /// Returns `None` for a slot without a block.
    pub async fn request_block(&self, slot: Slot) -> Result<Option<NormalizedBlock>> {
        self.request_block_by_id(slot, BlockId::Slot(slot)).await
    }

    pub async fn request_block_by_root(
        &self,
        slot: Slot,
        root: H256,
    ) -> Result<Option<NormalizedBlock>> {
        self.request_block_by_id(slot, BlockId::Root(root)).await
    }

    pub async fn request_proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>> {
        let resource = format!("proposer_duties={epoch}");
        let _page = self.block_book.acquire(resource.as_str()).await?;
        let beacon_node = self.beacon_node.as_ref();

        self.retry(&resource, || beacon_node.proposer_duties(epoch))
            .await
    }

    pub async fn request_transactions(
        &self,
        block_number: ExecutionBlockNumber,
    ) -> Result<Vec<Transaction>> {
        let Some(execution_node) = self.execution_node.as_deref() else {
            bail!(Error::NoExecutionNode);
        };

        let resource = format!("transactions={block_number}");
        let _page = self.transaction_book.acquire(resource.as_str()).await?;

        self.retry(&resource, || execution_node.transactions(block_number))
            .await
    }

    /// Deposit contract logs of an execution block.
    /// The contract address comes from the chain configuration.
    pub async fn request_eth1_deposits(
        &self,
        block_number: ExecutionBlockNumber,
    ) -> Result<Vec<Eth1Deposit>> {
        let Some(execution_node) = self.execution_node.as_deref() else {
            bail!(Error::NoExecutionNode);
        };

        let resource = format!("deposits={block_number}");
        let _page = self.transaction_book.acquire(resource.as_str()).await?;
        let contract = self.config.deposit_contract_address;

        self.retry(&resource, || execution_node.deposits(block_number, contract))
            .await
    }

    pub async fn subscribe_events(&self) -> Result<EventStream> {
        let beacon_node = self.beacon_node.as_ref();

        self.retry(crate::events::RESOURCE, || beacon_node.events())
            .await
    }

    async fn request_state_with_root(
        &self,
        slot: Slot,
        state_id: StateId,
        known_root: Option<H256>,
    ) -> Result<NormalizedState> {
        let resource = format!("state={slot}");
        let _page = self.state_book.acquire(resource.as_str()).await?;
        let beacon_node = self.beacon_node.as_ref();
        let start = Instant::now();

        let Some(mut state) = self
            .retry(&resource, || beacon_node.state(state_id))
            .await?
        else {
            bail!(Error::NotFound { resource });
        };

        state.state_root = match known_root.filter(|root| !root.is_zero()) {
            Some(root) => root,
            None => self.fetch_state_root(slot).await?,
        };

        info!("downloaded state at slot {slot} in {:?}", start.elapsed());

        Ok(state)
    }

    async fn request_block_by_id(
        &self,
        slot: Slot,
        block_id: BlockId,
    ) -> Result<Option<NormalizedBlock>> {
        let resource = format!("block={slot}");
        let _page = self.block_book.acquire(resource.as_str()).await?;
        let beacon_node = self.beacon_node.as_ref();
        let start = Instant::now();

        let block = self
            .retry(&resource, || beacon_node.block(block_id))
            .await?;

        info!("downloaded block at slot {slot} in {:?}", start.elapsed());

        Ok(block)
    }

    async fn fetch_state_root(&self, slot: Slot) -> Result<H256> {
        let resource = format!("state_root={slot}");
        let beacon_node = self.beacon_node.as_ref();

        match self
            .retry(&resource, || beacon_node.state_root(StateId::Slot(slot)))
            .await?
        {
            Some(root) => Ok(root),
            None => bail!(Error::NotFound { resource }),
        }
    }

    /// Runs `request` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// Only transient failures are retried, after a fixed wait. Cancellation is checked before
    /// every attempt and interrupts the wait.
    async fn retry<T, F>(
        &self,
        resource: &str,
        mut request: impl FnMut() -> F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        let mut attempts = 0;

        loop {
            ensure!(
                !self.cancellation.is_cancelled(),
                Error::Cancelled {
                    resource: resource.to_owned(),
                },
            );

            attempts += 1;

            let error = match request().await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if !error.is_transient() {
                bail!(error);
            }

            if attempts >= self.max_retries {
                bail!(SlotUnavailable {
                    resource: resource.to_owned(),
                    attempts,
                    last_error: error.to_string(),
                });
            }

            warn!(
                "attempt {attempts}/{} for {resource} failed ({error}), retrying in {:?}",
                self.max_retries, self.retry_interval,
            );

            tokio::select! {
                () = self.cancellation.cancelled() => bail!(Error::Cancelled {
                    resource: resource.to_owned(),
                }),
                () = sleep(self.retry_interval) => {}
            }
        }
    }
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("maximum request retries must be positive")]
    ZeroRetries,
    #[error("request for {resource} was cancelled")]
    Cancelled { resource: String },
    #[error("node does not have {resource}")]
    NotFound { resource: String },
    #[error("no execution node is configured")]
    NoExecutionNode,
}
