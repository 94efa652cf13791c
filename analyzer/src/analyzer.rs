use core::{num::NonZeroU64, ops::RangeInclusive};
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{ensure, Result};
use beacon_api::{FinalizedEndSlot, Fetcher};
use futures::{future, stream, StreamExt as _};
use helper_functions::misc::{
    compute_end_slot_at_epoch, compute_epoch_at_slot, compute_start_slot_at_epoch,
    compute_timestamp_at_slot, is_epoch_boundary, slots_in_epoch,
};
use log::{debug, info, warn};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use types::{
    config::Config,
    containers::{
        BlockRewards, Eth1Deposit, HeadEvent, NodeEvent, NormalizedBlock, NormalizedState,
        ProposerDuty, Transaction,
    },
    models::{
        BlockRecord, BlsToExecutionChangeRecord, DepositRecord, Eth1DepositRecord, Model,
        ProposerDutyRecord, SlashingRecord, TransactionRecord, WithdrawalRecord,
    },
    primitives::{Epoch, Slot, UnixSeconds, H256},
};

use crate::{
    aggregation::RewardsAggregator,
    boundary_cache::EpochBoundaryCache,
    pools::Pools,
    report::RunReport,
    rewards::{self, EpochActivity},
    sink::ModelSink,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DownloadMode {
    /// Processes `slots` and stops.
    Historical { slots: RangeInclusive<Slot> },
    /// Follows the head of the chain from the first announced block.
    Head,
    /// Processes `slots`, then follows the head starting right after them.
    Hybrid { slots: RangeInclusive<Slot> },
}

#[derive(Clone, Debug)]
pub struct Options {
    pub mode: DownloadMode,
    /// Number of slots fetched ahead of the one being processed.
    pub look_ahead: usize,
    /// Length of the windows validator rewards are summed over. Disabled if `None`.
    pub rewards_aggregation_epochs: Option<NonZeroU64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AnalyzerPhase {
    Idle,
    /// Processing historical slots. Holds the slot being processed.
    Backfilling(Slot),
    LiveFollowing,
    /// Closed. Slots already started are being finished.
    Draining,
    Stopped,
}

#[derive(Clone)]
pub struct AnalyzerHandle {
    phase: Arc<RwLock<AnalyzerPhase>>,
    close: CancellationToken,
}

impl AnalyzerHandle {
    /// Stops the analyzer from starting new slots.
    ///
    /// Slots already being processed are finished and their records emitted.
    pub fn close(&self) {
        {
            let mut phase = self.phase.write();

            if *phase != AnalyzerPhase::Stopped {
                *phase = AnalyzerPhase::Draining;
            }
        }

        self.close.cancel();
    }

    #[must_use]
    pub fn phase(&self) -> AnalyzerPhase {
        *self.phase.read()
    }
}

struct FetchedSlot {
    block: NormalizedBlock,
    rewards: Option<BlockRewards>,
    transactions: Vec<Transaction>,
    eth1_deposits: Vec<Eth1Deposit>,
}

/// Turns chain data into [`Model`]s.
///
/// Slots are processed strictly in order. Records of a slot are emitted in the order
/// block, epoch records (at epoch boundaries), withdrawals, slashings, deposits,
/// BLS to execution changes, transactions, deposit contract logs.
pub struct Analyzer<S> {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    sink: S,
    pools: Pools,
    options: Options,
    aggregator: Option<RewardsAggregator>,
    boundary_cache: Arc<EpochBoundaryCache>,
    phase: Arc<RwLock<AnalyzerPhase>>,
    close: CancellationToken,
    genesis_time: UnixSeconds,
    // Processed blocks of the latest boundary epoch and the one being processed.
    blocks: BTreeMap<Slot, BlockRecord>,
    // Boundary states of the last two processed epochs.
    boundaries: BTreeMap<Epoch, NormalizedState>,
    next_slot: Option<Slot>,
    report: RunReport,
}

impl<S: ModelSink> Analyzer<S> {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<Fetcher>,
        sink: S,
        pools: Pools,
        options: Options,
    ) -> Result<Self> {
        ensure!(options.look_ahead > 0, Error::ZeroLookAhead);

        if let DownloadMode::Historical { slots } | DownloadMode::Hybrid { slots } = &options.mode {
            ensure!(
                !slots.is_empty(),
                Error::EmptyRange {
                    start: *slots.start(),
                    end: *slots.end(),
                },
            );
        }

        let aggregator = options.rewards_aggregation_epochs.map(RewardsAggregator::new);

        Ok(Self {
            config,
            fetcher,
            sink,
            pools,
            options,
            aggregator,
            boundary_cache: Arc::default(),
            phase: Arc::new(RwLock::new(AnalyzerPhase::Idle)),
            close: CancellationToken::new(),
            genesis_time: 0,
            blocks: BTreeMap::new(),
            boundaries: BTreeMap::new(),
            next_slot: None,
            report: RunReport::default(),
        })
    }

    #[must_use]
    pub fn handle(&self) -> AnalyzerHandle {
        AnalyzerHandle {
            phase: Arc::clone(&self.phase),
            close: self.close.clone(),
        }
    }

    #[must_use]
    pub fn boundary_cache(&self) -> Arc<EpochBoundaryCache> {
        Arc::clone(&self.boundary_cache)
    }

    /// Runs until the slot range is processed or the analyzer is closed.
    ///
    /// Errors are only returned when records can no longer be emitted
    /// or the genesis time cannot be determined.
    pub async fn run(mut self) -> Result<RunReport> {
        let result = self.run_mode().await;

        self.set_phase(AnalyzerPhase::Stopped);

        result.map(|()| self.report)
    }

    async fn run_mode(&mut self) -> Result<()> {
        self.genesis_time = self.fetcher.request_genesis_time().await?;

        match self.options.mode.clone() {
            DownloadMode::Historical { slots } => self.backfill(slots).await,
            DownloadMode::Head => self.follow_head().await,
            DownloadMode::Hybrid { slots } => {
                self.backfill(slots).await?;
                self.follow_head().await
            }
        }
    }

    async fn backfill(&mut self, slots: RangeInclusive<Slot>) -> Result<()> {
        info!("processing slots {}..={}", slots.start(), slots.end());

        self.set_phase(AnalyzerPhase::Backfilling(*slots.start()));
        self.process_range(slots).await
    }

    async fn follow_head(&mut self) -> Result<()> {
        let close = self.close.clone();

        self.set_phase(AnalyzerPhase::LiveFollowing);

        while !close.is_cancelled() {
            let mut events = match self.fetcher.subscribe_events().await {
                Ok(events) => events,
                Err(error) => {
                    warn!("unable to subscribe to node events: {error:?}");

                    select! {
                        () = close.cancelled() => break,
                        () = sleep(self.fetcher.retry_interval()) => continue,
                    }
                }
            };

            info!("following chain head");

            loop {
                select! {
                    () = close.cancelled() => break,

                    event = events.next() => match event {
                        Some(Ok(event)) => self.handle_event(event).await?,
                        Some(Err(error)) => warn!("skipping node event: {error}"),
                        None => {
                            warn!("node event stream ended, subscribing again");
                            break;
                        }
                    },
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&mut self, event: NodeEvent) -> Result<()> {
        match event {
            NodeEvent::Head(head) => {
                self.sink.emit(Model::HeadEvent(head)).await?;

                if is_epoch_boundary(&self.config, head.slot) {
                    self.boundary_cache.set(head.slot, head.state);
                }

                self.follow(head).await
            }
            NodeEvent::ChainReorg(reorg) => {
                warn!(
                    "node reported reorg of depth {} at slot {}",
                    reorg.depth, reorg.slot,
                );

                self.sink.emit(Model::Reorg(reorg)).await?;
                self.report.reorgs += 1;

                let first_slot = (reorg.slot + 1).saturating_sub(reorg.depth);

                self.verify_slots(first_slot..=reorg.slot).await
            }
            NodeEvent::FinalizedCheckpoint(checkpoint) => {
                info!("epoch {} finalized", checkpoint.epoch);

                self.sink.emit(Model::FinalizedCheckpoint(checkpoint)).await?;
                self.verify_finalized().await
            }
        }
    }

    async fn follow(&mut self, head: HeadEvent) -> Result<()> {
        let next_slot = *self.next_slot.get_or_insert(head.slot);

        if head.slot >= next_slot {
            return self.process_range(next_slot..=head.slot).await;
        }

        let replaced = self
            .blocks
            .get(&head.slot)
            .is_some_and(|record| record.block.root != head.block);

        if replaced {
            match self.fetcher.request_block_by_root(head.slot, head.block).await {
                Ok(block) => {
                    let block = block.unwrap_or_else(|| NormalizedBlock::missed(head.slot));
                    self.reorganize(head.slot, block).await?;
                }
                Err(error) => {
                    warn!(
                        "unable to fetch new head block at slot {}: {error:?}",
                        head.slot,
                    );
                }
            }
        }

        Ok(())
    }

    async fn process_range(&mut self, slots: RangeInclusive<Slot>) -> Result<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let close = self.close.clone();

        let mut fetched_slots = stream::iter(slots)
            .take_while(move |_| future::ready(!close.is_cancelled()))
            .map(move |slot| {
                let fetcher = Arc::clone(&fetcher);
                async move { (slot, fetch_slot(&fetcher, slot).await) }
            })
            .buffered(self.options.look_ahead);

        while let Some((slot, result)) = fetched_slots.next().await {
            if matches!(self.phase(), AnalyzerPhase::Backfilling(_)) {
                self.set_phase(AnalyzerPhase::Backfilling(slot));
            }

            match result {
                Ok(fetched) => {
                    self.persist_slot(slot, fetched, false).await?;
                    self.report.processed_slots += 1;
                }
                Err(error) => self.skip_slot(slot, &error),
            }

            self.next_slot = Some(slot + 1);
        }

        Ok(())
    }

    async fn persist_slot(
        &mut self,
        slot: Slot,
        fetched: FetchedSlot,
        reprocess: bool,
    ) -> Result<()> {
        let FetchedSlot {
            block,
            rewards,
            transactions,
            eth1_deposits,
        } = fetched;

        let record = BlockRecord {
            epoch: compute_epoch_at_slot(&self.config, slot),
            timestamp: compute_timestamp_at_slot(&self.config, self.genesis_time, slot),
            block,
            rewards,
        };

        debug!(
            "slot {slot}: proposed: {}, root: {:?}",
            record.block.proposed, record.block.root,
        );

        let withdrawals = record
            .block
            .withdrawals()
            .iter()
            .map(|withdrawal| WithdrawalRecord {
                slot,
                withdrawal: *withdrawal,
            })
            .collect::<Vec<_>>();

        let operations = operation_records(&record);

        let payload = record
            .block
            .execution_payload
            .as_ref()
            .map(|payload| (payload.block_number, payload.timestamp));

        self.sink.emit(Model::Block(record.clone())).await?;
        self.blocks.insert(slot, record);

        if is_epoch_boundary(&self.config, slot) {
            self.process_boundary(slot, None, reprocess).await?;
        }

        for withdrawal in withdrawals {
            self.sink.emit(Model::Withdrawal(withdrawal)).await?;
        }

        for operation in operations {
            self.sink.emit(operation).await?;
        }

        if let Some((block_number, timestamp)) = payload {
            for transaction in transactions {
                let record = TransactionRecord {
                    slot,
                    block_number,
                    timestamp,
                    transaction,
                };

                self.sink.emit(Model::Transaction(record)).await?;
            }

            for deposit in eth1_deposits {
                let record = Eth1DepositRecord {
                    slot,
                    timestamp,
                    deposit,
                };

                self.sink.emit(Model::Eth1Deposit(record)).await?;
            }
        }

        Ok(())
    }

    /// Emits the records derived from the boundary state at `slot`.
    ///
    /// The state is looked up by `root` if given, then by a root announced in a head event,
    /// and by slot otherwise.
    async fn process_boundary(
        &mut self,
        slot: Slot,
        root: Option<H256>,
        reprocess: bool,
    ) -> Result<()> {
        let epoch = compute_epoch_at_slot(&self.config, slot);

        let (state, duties) = match self.fetch_boundary(slot, root).await {
            Ok(boundary) => boundary,
            Err(error) => {
                warn!(
                    "skipping records of epoch {epoch}: \
                     boundary state at slot {slot} unavailable: {error:?}",
                );
                self.report.skipped_epochs.push(epoch);
                return Ok(());
            }
        };

        let previous_epoch = epoch.checked_sub(1);

        if reprocess {
            if let Some(previous_epoch) = previous_epoch {
                self.sink.emit(Model::EpochDrop(previous_epoch)).await?;
                self.sink.emit(Model::ValidatorRewardsDrop(previous_epoch)).await?;
            }

            self.sink.emit(Model::ProposerDutyDrop(epoch)).await?;
        }

        if let Some(previous_epoch) = previous_epoch {
            let record = rewards::epoch_record(&self.config, &state, previous_epoch);
            self.sink.emit(Model::Epoch(record)).await?;

            if let Some(previous) = self.boundaries.get(&previous_epoch) {
                let blocks = self
                    .blocks
                    .range(slots_in_epoch(&self.config, epoch))
                    .map(|(_, record)| (&record.block, record.rewards.as_ref()));

                let activity = EpochActivity::new(&duties, blocks);
                let validator_rewards =
                    rewards::validator_rewards(&self.config, previous, &state, &activity);
                let summaries = self.pools.summarize(previous_epoch, &validator_rewards);

                let aggregations = self
                    .aggregator
                    .as_mut()
                    .map(|aggregator| aggregator.add(previous_epoch, &validator_rewards))
                    .unwrap_or_default();

                for rewards in validator_rewards {
                    self.sink.emit(Model::ValidatorRewards(rewards)).await?;
                }

                for summary in summaries {
                    self.sink.emit(Model::PoolSummary(summary)).await?;
                }

                for aggregation in aggregations {
                    self.sink.emit(aggregation).await?;
                }
            } else {
                debug!("no boundary state for epoch {previous_epoch}, rewards not computed");
            }
        }

        for status in rewards::last_statuses(&self.config, &state) {
            self.sink.emit(Model::ValidatorLastStatus(status)).await?;
        }

        for duty in duties {
            let proposed = self
                .blocks
                .get(&duty.slot)
                .is_some_and(|record| record.block.proposed);

            let record = ProposerDutyRecord {
                epoch,
                slot: duty.slot,
                validator_index: duty.validator_index,
                proposed,
            };

            self.sink.emit(Model::ProposerDuty(record)).await?;
        }

        self.boundaries.insert(epoch, state);
        self.boundaries.retain(|retained, _| retained + 1 >= epoch);

        let first_slot = compute_start_slot_at_epoch(&self.config, epoch);
        self.blocks.retain(|retained, _| *retained >= first_slot);

        if !reprocess {
            self.report.processed_epochs += 1;
        }

        Ok(())
    }

    async fn fetch_boundary(
        &self,
        slot: Slot,
        root: Option<H256>,
    ) -> Result<(NormalizedState, Vec<ProposerDuty>)> {
        let state = match root.or_else(|| self.boundary_cache.take(slot)) {
            Some(root) => self.fetcher.request_state_by_root(slot, root).await?,
            None => self.fetcher.request_state(slot).await?,
        };

        ensure!(
            state.slot == slot,
            Error::UnexpectedStateSlot {
                requested: slot,
                actual: state.slot,
            },
        );

        let epoch = compute_epoch_at_slot(&self.config, slot);
        let duties = self.fetcher.request_proposer_duties(epoch).await?;

        Ok((state, duties))
    }

    /// Compares processed blocks in `slots` with the canonical chain.
    async fn verify_slots(&mut self, slots: RangeInclusive<Slot>) -> Result<()> {
        for slot in slots {
            let Some(stored_root) = self.blocks.get(&slot).map(|record| record.block.root) else {
                continue;
            };

            let canonical = match self.fetcher.request_block(slot).await {
                Ok(block) => block.unwrap_or_else(|| NormalizedBlock::missed(slot)),
                Err(error) => {
                    warn!("unable to verify block at slot {slot}: {error:?}");
                    continue;
                }
            };

            if canonical.root != stored_root {
                self.reorganize(slot, canonical).await?;
            }
        }

        Ok(())
    }

    async fn verify_finalized(&mut self) -> Result<()> {
        let FinalizedEndSlot {
            slot, state_root, ..
        } = match self.fetcher.request_finalized_checkpoint().await {
            Ok(Some(finalized)) => finalized,
            Ok(None) => return Ok(()),
            Err(error) => {
                warn!("unable to check finalized checkpoint: {error:?}");
                return Ok(());
            }
        };

        self.verify_slots(slot..=slot).await?;

        let epoch = compute_epoch_at_slot(&self.config, slot);

        let diverged = self
            .boundaries
            .get(&epoch)
            .is_some_and(|state| state.state_root != state_root);

        if diverged {
            if self.latest_boundary_epoch() == Some(epoch) {
                warn!("boundary state of epoch {epoch} was not finalized, recomputing records");
                self.process_boundary(slot, Some(state_root), true).await?;
            } else {
                warn!("boundary state of epoch {epoch} was not finalized, records are stale");
            }
        }

        self.boundary_cache.prune_below(slot);

        Ok(())
    }

    /// Replaces the block processed for `slot` with `canonical`.
    async fn reorganize(&mut self, slot: Slot, canonical: NormalizedBlock) -> Result<()> {
        let Some(stale) = self.blocks.remove(&slot) else {
            return Ok(());
        };

        info!(
            "block {:?} at slot {slot} is no longer canonical, replacing it with {:?}",
            stale.block.root, canonical.root,
        );

        self.sink.emit(Model::BlockDrop(slot)).await?;

        if stale.block.proposed {
            self.report.orphans += 1;
            self.sink.emit(Model::Orphan(stale)).await?;
        }

        self.sink.emit(Model::WithdrawalDrop(slot)).await?;
        self.sink.emit(Model::TransactionDrop(slot)).await?;
        self.sink.emit(Model::SlashingDrop(slot)).await?;
        self.sink.emit(Model::DepositDrop(slot)).await?;
        self.sink.emit(Model::BlsToExecutionChangeDrop(slot)).await?;
        self.sink.emit(Model::Eth1DepositDrop(slot)).await?;

        let fetched = match complete_slot(&self.fetcher, canonical).await {
            Ok(fetched) => fetched,
            Err(error) => {
                self.skip_slot(slot, &error);
                return Ok(());
            }
        };

        self.persist_slot(slot, fetched, true).await?;

        if is_epoch_boundary(&self.config, slot) {
            return Ok(());
        }

        let epoch = compute_epoch_at_slot(&self.config, slot);

        match self.latest_boundary_epoch() {
            Some(latest) if latest == epoch => {
                let boundary_slot = compute_end_slot_at_epoch(&self.config, epoch);
                self.process_boundary(boundary_slot, None, true).await?;
            }
            Some(latest) if latest > epoch => {
                warn!("records of epoch {epoch} are not recomputed after reorg at slot {slot}");
            }
            _ => {}
        }

        Ok(())
    }

    fn skip_slot(&mut self, slot: Slot, error: &anyhow::Error) {
        warn!("skipping slot {slot}: {error:?}");
        self.report.skipped_slots.push(slot);
    }

    fn latest_boundary_epoch(&self) -> Option<Epoch> {
        self.boundaries.keys().next_back().copied()
    }

    fn phase(&self) -> AnalyzerPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: AnalyzerPhase) {
        let mut current = self.phase.write();

        // Only stopping leaves the draining phase.
        if *current != AnalyzerPhase::Draining || phase == AnalyzerPhase::Stopped {
            *current = phase;
        }
    }
}

/// Slashings, deposits and BLS to execution changes included in the block, in that order.
fn operation_records(record: &BlockRecord) -> Vec<Model> {
    let BlockRecord { epoch, block, .. } = record;
    let (slot, epoch) = (block.slot, *epoch);

    let slashings = block.slashings.iter().map(|slashing| {
        Model::Slashing(SlashingRecord {
            slot,
            epoch,
            slashed_by: block.proposer_index,
            slashing: *slashing,
        })
    });

    let deposits = block
        .deposits
        .iter()
        .enumerate()
        .map(|(position, deposit)| {
            Model::Deposit(DepositRecord {
                slot,
                epoch,
                position,
                deposit: *deposit,
            })
        });

    let changes = block.bls_to_execution_changes.iter().map(|change| {
        Model::BlsToExecutionChange(BlsToExecutionChangeRecord {
            slot,
            epoch,
            change: *change,
        })
    });

    slashings.chain(deposits).chain(changes).collect()
}

async fn fetch_slot(fetcher: &Fetcher, slot: Slot) -> Result<FetchedSlot> {
    let block = fetcher
        .request_block(slot)
        .await?
        .unwrap_or_else(|| NormalizedBlock::missed(slot));

    complete_slot(fetcher, block).await
}

async fn complete_slot(fetcher: &Fetcher, block: NormalizedBlock) -> Result<FetchedSlot> {
    let rewards = if block.proposed {
        fetcher.request_block_rewards(block.slot).await?
    } else {
        None
    };

    let (transactions, eth1_deposits) = match &block.execution_payload {
        Some(payload) if fetcher.has_execution_node() && payload.transaction_count > 0 => (
            fetcher.request_transactions(payload.block_number).await?,
            fetcher.request_eth1_deposits(payload.block_number).await?,
        ),
        _ => (vec![], vec![]),
    };

    Ok(FetchedSlot {
        block,
        rewards,
        transactions,
        eth1_deposits,
    })
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("look-ahead must be at least 1")]
    ZeroLookAhead,
    #[error("slot range {start}..={end} is empty")]
    EmptyRange { start: Slot, end: Slot },
    #[error("node returned state at slot {actual} when asked for slot {requested}")]
    UnexpectedStateSlot { requested: Slot, actual: Slot },
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::{collections::HashSet, path::Path};

    use async_trait::async_trait;
    use beacon_api::{
        BeaconNode, BlockId, EventStream, ExecutionNode, FetcherOptions, NodeError, StateId,
    };
    use database::{PersistenceEngine, PersistenceOptions, SqlitePool};
    use parking_lot::Mutex;
    use rusqlite::types::Value;
    use tempfile::TempDir;
    use types::{
        containers::{
            BlsToExecutionChange, ChainReorgEvent, Checkpoint, Deposit, ExecutionPayloadSummary,
            FinalityCheckpoints, FinalizedCheckpointEvent, Slashing, SlashingKind, Validator,
            Withdrawal,
        },
        models::{ModelType, ValidatorRewardsAggregation},
        nonstandard::Phase,
        primitives::{
            ExecutionAddress, ExecutionBlockNumber, Gwei, PublicKeyBytes, SignatureBytes, H160,
            U256,
        },
    };

    use super::*;

    const ETH: Gwei = 1_000_000_000;
    const GENESIS_TIME: UnixSeconds = 1_578_009_600;

    fn state_root(slot: Slot) -> H256 {
        H256::from_low_u64_be(10_000 + slot)
    }

    fn stale_state_root(slot: Slot) -> H256 {
        H256::from_low_u64_be(20_000 + slot)
    }

    fn block_root(slot: Slot, fork: u64) -> H256 {
        H256::from_low_u64_be(fork * 1_000 + slot + 1)
    }

    fn block(slot: Slot, fork: u64) -> NormalizedBlock {
        NormalizedBlock {
            root: block_root(slot, fork),
            proposer_index: slot % 4,
            proposed: true,
            ..NormalizedBlock::missed(slot)
        }
    }

    fn block_with_withdrawal(slot: Slot) -> NormalizedBlock {
        let payload = ExecutionPayloadSummary {
            block_hash: H256::repeat_byte(3),
            block_number: slot + 100,
            fee_recipient: H160::zero(),
            gas_limit: 30_000_000,
            gas_used: 0,
            base_fee_per_gas: U256::from(7_u64),
            timestamp: GENESIS_TIME + slot * 6,
            transaction_count: 0,
            transactions_size: 0,
            withdrawals: vec![Withdrawal {
                index: 1,
                validator_index: 2,
                address: H160::repeat_byte(2),
                amount: ETH,
            }],
        };

        NormalizedBlock {
            execution_payload: Some(payload),
            ..block(slot, 0)
        }
    }

    fn block_with_operations(slot: Slot, fork: u64) -> NormalizedBlock {
        let payload = ExecutionPayloadSummary {
            block_hash: H256::from_low_u64_be(50_000 + fork * 1_000 + slot),
            block_number: slot + 100,
            fee_recipient: H160::zero(),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            base_fee_per_gas: U256::from(7_u64),
            timestamp: GENESIS_TIME + slot * 6,
            transaction_count: 1,
            transactions_size: 110,
            withdrawals: vec![],
        };

        NormalizedBlock {
            deposits: vec![Deposit {
                pubkey: PublicKeyBytes::from_low_u64_be(fork),
                withdrawal_credentials: H256::repeat_byte(1),
                amount: 32 * ETH + fork,
                signature: SignatureBytes::repeat_byte(2),
            }],
            bls_to_execution_changes: vec![BlsToExecutionChange {
                validator_index: 1 + fork,
                from_bls_pubkey: PublicKeyBytes::repeat_byte(3),
                to_execution_address: H160::repeat_byte(4),
            }],
            proposer_slashings: 1,
            slashings: vec![Slashing {
                kind: SlashingKind::Proposer,
                validator_index: 3 - fork,
            }],
            execution_payload: Some(payload),
            ..block(slot, fork)
        }
    }

    fn state(slot: Slot) -> NormalizedState {
        let validator = Validator {
            effective_balance: 32 * ETH,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            ..Validator::default()
        };

        NormalizedState {
            phase: Phase::Capella,
            slot,
            state_root: state_root(slot),
            genesis_time: GENESIS_TIME,
            validators: vec![validator; 4],
            balances: vec![32 * ETH + slot * 1_000; 4],
            previous_epoch_participation: vec![0b111; 4],
            current_epoch_participation: vec![0b111; 4],
            current_sync_committee: vec![0, 1],
            current_justified_checkpoint: Checkpoint::default(),
            finalized_checkpoint: Checkpoint::default(),
        }
    }

    fn head(slot: Slot, fork: u64, state: H256) -> NodeEvent {
        NodeEvent::Head(HeadEvent {
            slot,
            block: block_root(slot, fork),
            state,
            epoch_transition: false,
        })
    }

    // A block to make canonical before an event is delivered.
    type Step = (Option<NormalizedBlock>, NodeEvent);

    #[derive(Default)]
    struct FakeNode {
        blocks: Arc<Mutex<BTreeMap<Slot, NormalizedBlock>>>,
        broken_slots: HashSet<Slot>,
        finalized_epoch: Epoch,
        // Serves execution data of the blocks as well.
        execution: bool,
        steps: Mutex<Option<Vec<Step>>>,
        handle: Mutex<Option<AnalyzerHandle>>,
        requested_states: Mutex<Vec<StateId>>,
    }

    impl FakeNode {
        fn with_blocks(blocks: impl IntoIterator<Item = NormalizedBlock>) -> Self {
            let blocks = blocks.into_iter().map(|block| (block.slot, block)).collect();

            Self {
                blocks: Arc::new(Mutex::new(blocks)),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl BeaconNode for FakeNode {
        async fn genesis_time(&self) -> Result<UnixSeconds, NodeError> {
            Ok(GENESIS_TIME)
        }

        async fn state(&self, state_id: StateId) -> Result<Option<NormalizedState>, NodeError> {
            self.requested_states.lock().push(state_id);

            let slot = match state_id {
                StateId::Slot(slot) => slot,
                StateId::Root(root) => root.to_low_u64_be() % 10_000,
                StateId::Head | StateId::Finalized => return Ok(None),
            };

            Ok(Some(state(slot)))
        }

        async fn state_root(&self, state_id: StateId) -> Result<Option<H256>, NodeError> {
            match state_id {
                StateId::Slot(slot) => Ok(Some(state_root(slot))),
                _ => Ok(None),
            }
        }

        async fn finality(&self, _state_id: StateId) -> Result<FinalityCheckpoints, NodeError> {
            Ok(FinalityCheckpoints {
                finalized: Checkpoint {
                    epoch: self.finalized_epoch,
                    root: H256::zero(),
                },
                ..FinalityCheckpoints::default()
            })
        }

        async fn block(&self, block_id: BlockId) -> Result<Option<NormalizedBlock>, NodeError> {
            match block_id {
                BlockId::Slot(slot) if self.broken_slots.contains(&slot) => {
                    Err(NodeError::Malformed {
                        resource: format!("block={slot}"),
                        message: "unexpected fork".to_owned(),
                    })
                }
                BlockId::Slot(slot) => Ok(self.blocks.lock().get(&slot).cloned()),
                BlockId::Root(root) => Ok(self
                    .blocks
                    .lock()
                    .values()
                    .find(|block| block.root == root)
                    .cloned()),
                BlockId::Head | BlockId::Finalized => Ok(None),
            }
        }

        async fn block_rewards(&self, slot: Slot) -> Result<Option<BlockRewards>, NodeError> {
            Ok(Some(BlockRewards {
                proposer_index: slot % 4,
                total: 20_000,
                ..BlockRewards::default()
            }))
        }

        async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>, NodeError> {
            let duties = (epoch * 8..(epoch + 1) * 8)
                .map(|slot| ProposerDuty {
                    slot,
                    validator_index: slot % 4,
                })
                .collect();

            Ok(duties)
        }

        async fn events(&self) -> Result<EventStream, NodeError> {
            let Some(steps) = self.steps.lock().take() else {
                return Ok(stream::pending().boxed());
            };

            let blocks = Arc::clone(&self.blocks);
            let handle = self.handle.lock().clone();

            let events = stream::iter(steps)
                .map(move |(replacement, event)| {
                    if let Some(block) = replacement {
                        blocks.lock().insert(block.slot, block);
                    }

                    Ok::<_, NodeError>(event)
                })
                .chain(
                    stream::once(async move {
                        if let Some(handle) = handle {
                            handle.close();
                        }
                    })
                    .filter_map(|()| future::ready(None)),
                );

            Ok(events.boxed())
        }
    }

    #[async_trait]
    impl ExecutionNode for FakeNode {
        async fn transactions(
            &self,
            block_number: ExecutionBlockNumber,
        ) -> Result<Vec<Transaction>, NodeError> {
            let transactions = self
                .blocks
                .lock()
                .values()
                .filter_map(|block| block.execution_payload.as_ref())
                .filter(|payload| payload.block_number == block_number)
                .map(|payload| Transaction {
                    hash: payload.block_hash,
                    tx_type: 2,
                    chain_id: Some(1),
                    nonce: block_number,
                    gas: 21_000,
                    gas_price: None,
                    gas_tip_cap: Some(U256::from(2_u64)),
                    gas_fee_cap: Some(U256::from(9_u64)),
                    value: U256::from(ETH),
                    from: H160::repeat_byte(6),
                    to: Some(H160::repeat_byte(7)),
                    input_size: 0,
                })
                .collect();

            Ok(transactions)
        }

        async fn deposits(
            &self,
            block_number: ExecutionBlockNumber,
            _contract: ExecutionAddress,
        ) -> Result<Vec<Eth1Deposit>, NodeError> {
            let deposits = self
                .blocks
                .lock()
                .values()
                .filter_map(|block| {
                    let payload = block.execution_payload.as_ref()?;
                    let deposit = block.deposits.first()?;

                    (payload.block_number == block_number).then_some(Eth1Deposit {
                        block_number,
                        block_hash: payload.block_hash,
                        transaction_hash: payload.block_hash,
                        log_index: 0,
                        deposit: *deposit,
                        index: block.slot,
                    })
                })
                .collect();

            Ok(deposits)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        models: Arc<Mutex<Vec<Model>>>,
    }

    impl RecordingSink {
        fn models(&self) -> Vec<Model> {
            self.models.lock().clone()
        }

        fn types(&self) -> Vec<ModelType> {
            self.models.lock().iter().map(Model::model_type).collect()
        }
    }

    #[async_trait]
    impl ModelSink for RecordingSink {
        async fn emit(&self, model: Model) -> Result<()> {
            self.models.lock().push(model);
            Ok(())
        }
    }

    fn new_analyzer(
        node: &Arc<FakeNode>,
        sink: &RecordingSink,
        mode: DownloadMode,
    ) -> Result<Analyzer<RecordingSink>> {
        let options = Options {
            mode,
            look_ahead: 4,
            rewards_aggregation_epochs: None,
        };

        analyzer_with_sink(node, sink.clone(), options)
    }

    fn analyzer_with_sink<S: ModelSink>(
        node: &Arc<FakeNode>,
        sink: S,
        options: Options,
    ) -> Result<Analyzer<S>> {
        let config = Arc::new(Config::minimal());

        let fetcher_options = FetcherOptions {
            max_retries: 2,
            retry_interval: Duration::from_millis(1),
            state_book_size: 2,
            block_book_size: 4,
            transaction_book_size: 1,
        };

        let beacon_node: Arc<dyn BeaconNode> = Arc::<FakeNode>::clone(node);

        let execution_node: Option<Arc<dyn ExecutionNode>> = if node.execution {
            Some(Arc::<FakeNode>::clone(node))
        } else {
            None
        };

        let fetcher = Fetcher::new(
            Arc::clone(&config),
            beacon_node,
            execution_node,
            fetcher_options,
            CancellationToken::new(),
        )?;

        let analyzer = Analyzer::new(
            config,
            Arc::new(fetcher),
            sink,
            Pools::from_yaml("lido: [{ start: 0, end: 1 }]")?,
            options,
        )?;

        node.handle.lock().replace(analyzer.handle());

        Ok(analyzer)
    }

    fn block_slots(models: &[Model]) -> Vec<(Slot, bool)> {
        models
            .iter()
            .filter_map(|model| match model {
                Model::Block(record) => Some((record.block.slot, record.block.proposed)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn historical_range_is_processed_in_order() -> Result<()> {
        let blocks = (0..24)
            .filter(|slot| *slot != 5)
            .map(|slot| match slot {
                23 => block_with_withdrawal(slot),
                _ => block(slot, 0),
            });

        let node = Arc::new(FakeNode::with_blocks(blocks));
        let sink = RecordingSink::default();
        let mode = DownloadMode::Historical { slots: 0..=23 };
        let analyzer = new_analyzer(&node, &sink, mode)?;
        let handle = analyzer.handle();

        let report = analyzer.run().await?;

        assert_eq!(report.processed_slots, 24);
        assert_eq!(report.processed_epochs, 3);
        assert!(report.skipped_slots.is_empty());
        assert_eq!(handle.phase(), AnalyzerPhase::Stopped);

        let models = sink.models();
        let slots = block_slots(&models);

        assert_eq!(slots.len(), 24);
        assert!(slots.iter().map(|(slot, _)| *slot).eq(0..24));
        assert_eq!(slots[5], (5, false));

        let Some(Model::Block(first)) = models.first() else {
            panic!("first record should be a block");
        };

        assert_eq!(first.timestamp, GENESIS_TIME);

        // Epochs 0 and 1 are followed by a boundary to compute their rewards from.
        let rewards = models
            .iter()
            .filter_map(|model| match model {
                Model::ValidatorRewards(rewards) => Some(rewards),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(rewards.len(), 8);
        assert!(rewards.iter().take(4).all(|rewards| rewards.epoch == 0));
        assert!(rewards.iter().skip(4).all(|rewards| rewards.epoch == 1));

        // The withdrawal in slot 23 happened between the boundaries of epochs 1 and 2.
        let withdrawn = rewards
            .iter()
            .filter(|rewards| rewards.epoch == 1)
            .map(|rewards| rewards.withdrawn)
            .collect::<Vec<_>>();

        assert_eq!(withdrawn, [0, 0, ETH, 0]);

        let pools = models
            .iter()
            .filter_map(|model| match model {
                Model::PoolSummary(summary) => Some((summary.epoch, summary.pool_name.as_str())),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(
            pools,
            [(0, "lido"), (0, "others"), (1, "lido"), (1, "others")],
        );

        let boundary_records = models
            .iter()
            .skip_while(|model| !matches!(model, Model::Block(record) if record.block.slot == 23))
            .map(Model::model_type)
            .collect::<Vec<_>>();

        let mut expected = vec![ModelType::Block, ModelType::Epoch];
        expected.extend([ModelType::ValidatorRewards; 4]);
        expected.extend([ModelType::PoolSummary; 2]);
        expected.extend([ModelType::ValidatorLastStatus; 4]);
        expected.extend([ModelType::ProposerDuty; 8]);
        expected.push(ModelType::Withdrawal);

        assert_eq!(boundary_records, expected);

        Ok(())
    }

    #[tokio::test]
    async fn unavailable_slot_is_skipped() -> Result<()> {
        let node = Arc::new(FakeNode {
            broken_slots: HashSet::from([3]),
            ..FakeNode::with_blocks((0..8).map(|slot| block(slot, 0)))
        });

        let sink = RecordingSink::default();
        let mode = DownloadMode::Historical { slots: 0..=7 };
        let report = new_analyzer(&node, &sink, mode)?.run().await?;

        assert_eq!(report.processed_slots, 7);
        assert_eq!(report.skipped_slots, [3]);

        let slots = block_slots(&sink.models())
            .into_iter()
            .map(|(slot, _)| slot)
            .collect::<Vec<_>>();

        assert_eq!(slots, [0, 1, 2, 4, 5, 6, 7]);

        Ok(())
    }

    #[tokio::test]
    async fn replaced_head_block_is_orphaned() -> Result<()> {
        let node = Arc::new(FakeNode::with_blocks((1..=4).map(|slot| block(slot, 0))));

        node.steps.lock().replace(vec![
            (None, head(3, 0, state_root(3))),
            (None, head(4, 0, state_root(4))),
            (Some(block(4, 1)), head(4, 1, state_root(4))),
        ]);

        let sink = RecordingSink::default();
        let report = new_analyzer(&node, &sink, DownloadMode::Head)?.run().await?;

        assert_eq!(report.processed_slots, 2);
        assert_eq!(report.orphans, 1);

        let slot_4 = sink
            .models()
            .into_iter()
            .filter_map(|model| match model {
                Model::Block(record) if record.block.slot == 4 => {
                    Some(("block", Some(record.block.root)))
                }
                Model::Orphan(record) => Some(("orphan", Some(record.block.root))),
                Model::BlockDrop(4) => Some(("drop", None)),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(
            slot_4,
            [
                ("block", Some(block_root(4, 0))),
                ("drop", None),
                ("orphan", Some(block_root(4, 0))),
                ("block", Some(block_root(4, 1))),
            ],
        );

        let head_events = sink
            .types()
            .into_iter()
            .filter(|model_type| *model_type == ModelType::HeadEvent)
            .count();

        assert_eq!(head_events, 3);

        Ok(())
    }

    #[tokio::test]
    async fn reported_reorg_rechecks_recent_slots() -> Result<()> {
        let node = Arc::new(FakeNode::with_blocks((1..=2).map(|slot| block(slot, 0))));

        let reorg = NodeEvent::ChainReorg(ChainReorgEvent {
            slot: 2,
            depth: 2,
            old_head_block: block_root(2, 0),
            new_head_block: block_root(2, 1),
            old_head_state: state_root(2),
            new_head_state: state_root(2),
            epoch: 0,
        });

        node.steps.lock().replace(vec![
            (None, head(1, 0, state_root(1))),
            (None, head(2, 0, state_root(2))),
            (Some(block(2, 1)), reorg),
        ]);

        let sink = RecordingSink::default();
        let report = new_analyzer(&node, &sink, DownloadMode::Head)?.run().await?;

        assert_eq!(report.reorgs, 1);
        assert_eq!(report.orphans, 1);

        let after_reorg = sink
            .types()
            .into_iter()
            .skip_while(|model_type| *model_type != ModelType::Reorg)
            .collect::<Vec<_>>();

        assert_eq!(
            after_reorg,
            [
                ModelType::Reorg,
                ModelType::BlockDrop,
                ModelType::Orphan,
                ModelType::WithdrawalDrop,
                ModelType::TransactionDrop,
                ModelType::SlashingDrop,
                ModelType::DepositDrop,
                ModelType::BlsToExecutionChangeDrop,
                ModelType::Eth1DepositDrop,
                ModelType::Block,
            ],
        );

        Ok(())
    }

    #[tokio::test]
    async fn boundary_state_is_fetched_by_announced_root() -> Result<()> {
        let node = Arc::new(FakeNode::with_blocks([block(7, 0)]));

        node.steps
            .lock()
            .replace(vec![(None, head(7, 0, state_root(7)))]);

        let sink = RecordingSink::default();
        let analyzer = new_analyzer(&node, &sink, DownloadMode::Head)?;
        let boundary_cache = analyzer.boundary_cache();

        let report = analyzer.run().await?;

        assert_eq!(report.processed_epochs, 1);
        assert_eq!(
            node.requested_states.lock().as_slice(),
            [StateId::Root(state_root(7))],
        );
        assert_eq!(boundary_cache.len(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn diverged_finalized_boundary_is_recomputed() -> Result<()> {
        let node = Arc::new(FakeNode {
            finalized_epoch: 2,
            ..FakeNode::with_blocks((8..16).map(|slot| block(slot, 0)))
        });

        let finalized = NodeEvent::FinalizedCheckpoint(FinalizedCheckpointEvent {
            block: block_root(16, 0),
            state: state_root(16),
            epoch: 2,
        });

        node.steps.lock().replace(vec![
            (None, head(15, 0, stale_state_root(15))),
            (None, finalized),
        ]);

        let sink = RecordingSink::default();
        new_analyzer(&node, &sink, DownloadMode::Head)?.run().await?;

        let after_finality = sink
            .types()
            .into_iter()
            .skip_while(|model_type| *model_type != ModelType::FinalizedCheckpoint)
            .take(5)
            .collect::<Vec<_>>();

        assert_eq!(
            after_finality,
            [
                ModelType::FinalizedCheckpoint,
                ModelType::EpochDrop,
                ModelType::ValidatorRewardsDrop,
                ModelType::ProposerDutyDrop,
                ModelType::Epoch,
            ],
        );

        assert_eq!(
            node.requested_states.lock().as_slice(),
            [
                StateId::Root(stale_state_root(15)),
                StateId::Root(state_root(15)),
            ],
        );

        Ok(())
    }

    #[tokio::test]
    async fn closed_analyzer_starts_no_slots() -> Result<()> {
        let node = Arc::new(FakeNode::with_blocks((0..64).map(|slot| block(slot, 0))));
        let sink = RecordingSink::default();
        let mode = DownloadMode::Hybrid { slots: 0..=63 };
        let analyzer = new_analyzer(&node, &sink, mode)?;
        let handle = analyzer.handle();

        handle.close();

        assert_eq!(handle.phase(), AnalyzerPhase::Draining);

        let report = analyzer.run().await?;

        assert_eq!(report.processed_slots, 0);
        assert!(sink.models().is_empty());
        assert_eq!(handle.phase(), AnalyzerPhase::Stopped);

        Ok(())
    }

    #[tokio::test]
    async fn block_operations_follow_withdrawals() -> Result<()> {
        let node = Arc::new(FakeNode {
            execution: true,
            ..FakeNode::with_blocks([block(0, 0), block_with_operations(1, 0)])
        });

        let sink = RecordingSink::default();
        let mode = DownloadMode::Historical { slots: 0..=1 };
        new_analyzer(&node, &sink, mode)?.run().await?;

        let models = sink.models();
        let slot_1 = models
            .iter()
            .skip_while(|model| !matches!(model, Model::Block(record) if record.block.slot == 1))
            .map(Model::model_type)
            .collect::<Vec<_>>();

        assert_eq!(
            slot_1,
            [
                ModelType::Block,
                ModelType::Slashing,
                ModelType::Deposit,
                ModelType::BlsToExecutionChange,
                ModelType::Transaction,
                ModelType::Eth1Deposit,
            ],
        );

        let expected = block_with_operations(1, 0);

        for model in models {
            match model {
                Model::Slashing(record) => {
                    assert_eq!(record.slashed_by, 1);
                    assert_eq!(record.slashing, expected.slashings[0]);
                }
                Model::Deposit(record) => {
                    assert_eq!((record.slot, record.position), (1, 0));
                    assert_eq!(record.deposit, expected.deposits[0]);
                }
                Model::BlsToExecutionChange(record) => {
                    assert_eq!(record.change, expected.bls_to_execution_changes[0]);
                }
                Model::Eth1Deposit(record) => {
                    assert_eq!(record.timestamp, GENESIS_TIME + 6);
                    assert_eq!(record.deposit.block_number, 101);
                    assert_eq!(record.deposit.deposit, expected.deposits[0]);
                }
                _ => {}
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn rewards_are_aggregated_per_window() -> Result<()> {
        let node = Arc::new(FakeNode::with_blocks((0..24).map(|slot| block(slot, 0))));
        let sink = RecordingSink::default();

        let options = Options {
            mode: DownloadMode::Historical { slots: 0..=23 },
            look_ahead: 4,
            rewards_aggregation_epochs: NonZeroU64::new(2),
        };

        analyzer_with_sink(&node, sink.clone(), options)?.run().await?;

        let models = sink.models();

        let rewards = models
            .iter()
            .filter_map(|model| match model {
                Model::ValidatorRewards(rewards) => Some(rewards),
                _ => None,
            })
            .collect::<Vec<_>>();

        let aggregations = models
            .iter()
            .filter_map(|model| match model {
                Model::ValidatorRewardsAggregationDrop(start) => Some(Err(*start)),
                Model::ValidatorRewardsAggregation(aggregation) => Some(Ok(aggregation)),
                _ => None,
            })
            .collect::<Vec<_>>();

        // Epochs 0 and 1 form the only complete window.
        assert_eq!(aggregations.len(), 5);
        assert_eq!(aggregations[0], Err(0));

        for (validator_index, aggregation) in (0..4).zip(aggregations.iter().skip(1)) {
            let mut expected = ValidatorRewardsAggregation::new(validator_index, 0, 1);

            for rewards in &rewards {
                if rewards.validator_index == validator_index {
                    expected.add(rewards);
                }
            }

            assert_eq!(*aggregation, Ok(&expected));
            assert_eq!(expected.epochs, 2);
        }

        Ok(())
    }

    const STORED_TABLES: [&str; 13] = [
        "t_block_metrics",
        "t_epoch_metrics_summary",
        "t_pool_summary",
        "t_proposer_duties",
        "t_validator_last_status",
        "t_validator_rewards_summary",
        "t_validator_rewards_aggregation",
        "t_withdrawals",
        "t_transactions",
        "t_slashings",
        "t_deposits",
        "t_bls_to_execution_changes",
        "t_eth1_deposits",
    ];

    fn chain_with(slot_20: &NormalizedBlock) -> FakeNode {
        let blocks = (0..24).map(|slot| match slot {
            20 => slot_20.clone(),
            23 => block_with_withdrawal(slot),
            _ => block(slot, 0),
        });

        FakeNode {
            execution: true,
            ..FakeNode::with_blocks(blocks)
        }
    }

    async fn analyze_into(
        path: &Path,
        node: &Arc<FakeNode>,
        mode: DownloadMode,
    ) -> Result<RunReport> {
        let engine = PersistenceEngine::start(
            SqlitePool::open(path)?,
            PersistenceOptions {
                workers: 3,
                batch_size: 16,
                flush_interval: Duration::from_millis(10),
                queue_capacity: 64,
            },
            CancellationToken::new(),
        )?;

        let options = Options {
            mode,
            look_ahead: 4,
            rewards_aggregation_epochs: NonZeroU64::new(2),
        };

        let report = analyzer_with_sink(node, engine.persister(), options)?
            .run()
            .await?;

        let persistence = engine.finish().await?;

        assert_eq!(persistence.failed_batches(), 0);

        Ok(report)
    }

    fn dump(path: &Path) -> Result<BTreeMap<&'static str, Vec<String>>> {
        let connection = rusqlite::Connection::open(path)?;
        let mut tables = BTreeMap::new();

        for table in STORED_TABLES {
            let mut statement = connection.prepare(&format!("SELECT * FROM {table}"))?;
            let column_count = statement.column_count();
            let mut query = statement.query([])?;
            let mut rows = vec![];

            while let Some(row) = query.next()? {
                let values = (0..column_count)
                    .map(|index| row.get::<_, Value>(index))
                    .collect::<Result<Vec<_>, _>>()?;

                rows.push(format!("{values:?}"));
            }

            rows.sort();
            tables.insert(table, rows);
        }

        Ok(tables)
    }

    #[tokio::test]
    async fn reprocessed_epochs_leave_the_same_rows() -> Result<()> {
        let single = TempDir::new()?;
        let repeated = TempDir::new()?;
        let single_path = single.path().join("analyzer.sqlite");
        let repeated_path = repeated.path().join("analyzer.sqlite");

        let canonical = Arc::new(chain_with(&block_with_operations(20, 1)));
        let mode = DownloadMode::Historical { slots: 0..=23 };
        analyze_into(&single_path, &canonical, mode).await?;

        // Slot 20 is replaced after epoch 2 was processed, so its records are recomputed.
        let reorged = Arc::new(chain_with(&block_with_operations(20, 0)));

        let reorg = NodeEvent::ChainReorg(ChainReorgEvent {
            slot: 20,
            depth: 1,
            old_head_block: block_root(20, 0),
            new_head_block: block_root(20, 1),
            old_head_state: state_root(20),
            new_head_state: state_root(20),
            epoch: 2,
        });

        reorged
            .steps
            .lock()
            .replace(vec![(Some(block_with_operations(20, 1)), reorg)]);

        let mode = DownloadMode::Hybrid { slots: 0..=23 };
        let report = analyze_into(&repeated_path, &reorged, mode).await?;

        assert_eq!(report.reorgs, 1);
        assert_eq!(report.orphans, 1);

        // Epochs 0 and 1 are processed again after epoch 2 was stored.
        let mode = DownloadMode::Historical { slots: 0..=15 };
        analyze_into(&repeated_path, &reorged, mode).await?;

        let expected = dump(&single_path)?;

        for (table, rows) in &expected {
            assert!(!rows.is_empty(), "{table} has no rows");
        }

        assert_eq!(dump(&repeated_path)?, expected);

        let connection = rusqlite::Connection::open(&repeated_path)?;

        let status_epochs = connection
            .prepare("SELECT DISTINCT epoch FROM t_validator_last_status")?
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(status_epochs, [2]);

        let aggregated_epochs = connection
            .prepare("SELECT DISTINCT epochs FROM t_validator_rewards_aggregation")?
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(aggregated_epochs, [2]);

        let deposit_amounts = connection
            .prepare("SELECT amount FROM t_deposits UNION ALL SELECT amount FROM t_eth1_deposits")?
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(deposit_amounts, [32_000_000_001, 32_000_000_001]);

        Ok(())
    }

    #[test]
    fn zero_look_ahead_is_rejected() -> Result<()> {
        let node = Arc::new(FakeNode::default());
        let config = Arc::new(Config::minimal());

        let fetcher = Fetcher::new(
            Arc::clone(&config),
            node,
            None,
            FetcherOptions {
                max_retries: 1,
                retry_interval: Duration::from_millis(1),
                state_book_size: 1,
                block_book_size: 1,
                transaction_book_size: 1,
            },
            CancellationToken::new(),
        )?;

        let error = Analyzer::new(
            config,
            Arc::new(fetcher),
            RecordingSink::default(),
            Pools::default(),
            Options {
                mode: DownloadMode::Head,
                look_ahead: 0,
                rewards_aggregation_epochs: None,
            },
        )
        .err()
        .expect("zero look-ahead should be rejected")
        .downcast::<Error>()?;

        assert_eq!(error, Error::ZeroLookAhead);

        Ok(())
    }
}
