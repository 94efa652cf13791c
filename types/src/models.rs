//! Derived records produced by the analyzer and consumed by the persistence engine.

use enum_map::Enum;
use strum::{AsRefStr, Display};

use crate::{
    containers::{
        BlockRewards, BlsToExecutionChange, ChainReorgEvent, Deposit, Eth1Deposit,
        FinalizedCheckpointEvent, HeadEvent, NormalizedBlock, Slashing, Transaction, Withdrawal,
    },
    nonstandard::ValidatorStatus,
    primitives::{
        Epoch, ExecutionBlockNumber, Gwei, GweiDelta, Slot, UnixSeconds, ValidatorIndex,
    },
};

/// Discriminant of [`Model`] used to look up statements.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Enum, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ModelType {
    Block,
    BlockDrop,
    Orphan,
    Epoch,
    EpochDrop,
    PoolSummary,
    ProposerDuty,
    ProposerDutyDrop,
    ValidatorLastStatus,
    ValidatorRewards,
    ValidatorRewardsDrop,
    Withdrawal,
    WithdrawalDrop,
    Transaction,
    TransactionDrop,
    Reorg,
    FinalizedCheckpoint,
    HeadEvent,
    ValidatorRewardsAggregation,
    ValidatorRewardsAggregationDrop,
    Slashing,
    SlashingDrop,
    BlsToExecutionChange,
    BlsToExecutionChangeDrop,
    Deposit,
    DepositDrop,
    Eth1Deposit,
    Eth1DepositDrop,
}

impl ModelType {
    #[must_use]
    pub const fn is_drop(self) -> bool {
        matches!(
            self,
            Self::BlockDrop
                | Self::EpochDrop
                | Self::ProposerDutyDrop
                | Self::ValidatorRewardsDrop
                | Self::WithdrawalDrop
                | Self::TransactionDrop
                | Self::ValidatorRewardsAggregationDrop
                | Self::SlashingDrop
                | Self::BlsToExecutionChangeDrop
                | Self::DepositDrop
                | Self::Eth1DepositDrop,
        )
    }
}

/// A unit of work for the persistence engine.
///
/// `*Drop` variants delete every row previously written for their key
/// so that a reprocessed slot or epoch can be inserted again.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Model {
    Block(BlockRecord),
    BlockDrop(Slot),
    Orphan(OrphanRecord),
    Epoch(EpochRecord),
    EpochDrop(Epoch),
    PoolSummary(PoolSummary),
    ProposerDuty(ProposerDutyRecord),
    ProposerDutyDrop(Epoch),
    ValidatorLastStatus(ValidatorLastStatus),
    ValidatorRewards(ValidatorRewards),
    ValidatorRewardsDrop(Epoch),
    Withdrawal(WithdrawalRecord),
    WithdrawalDrop(Slot),
    Transaction(TransactionRecord),
    TransactionDrop(Slot),
    Reorg(ChainReorgEvent),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
    HeadEvent(HeadEvent),
    ValidatorRewardsAggregation(ValidatorRewardsAggregation),
    /// Deletes the aggregations of the window starting at the given epoch.
    ValidatorRewardsAggregationDrop(Epoch),
    Slashing(SlashingRecord),
    SlashingDrop(Slot),
    BlsToExecutionChange(BlsToExecutionChangeRecord),
    BlsToExecutionChangeDrop(Slot),
    Deposit(DepositRecord),
    DepositDrop(Slot),
    Eth1Deposit(Eth1DepositRecord),
    Eth1DepositDrop(Slot),
}

impl Model {
    #[must_use]
    pub const fn model_type(&self) -> ModelType {
        match self {
            Self::Block(_) => ModelType::Block,
            Self::BlockDrop(_) => ModelType::BlockDrop,
            Self::Orphan(_) => ModelType::Orphan,
            Self::Epoch(_) => ModelType::Epoch,
            Self::EpochDrop(_) => ModelType::EpochDrop,
            Self::PoolSummary(_) => ModelType::PoolSummary,
            Self::ProposerDuty(_) => ModelType::ProposerDuty,
            Self::ProposerDutyDrop(_) => ModelType::ProposerDutyDrop,
            Self::ValidatorLastStatus(_) => ModelType::ValidatorLastStatus,
            Self::ValidatorRewards(_) => ModelType::ValidatorRewards,
            Self::ValidatorRewardsDrop(_) => ModelType::ValidatorRewardsDrop,
            Self::Withdrawal(_) => ModelType::Withdrawal,
            Self::WithdrawalDrop(_) => ModelType::WithdrawalDrop,
            Self::Transaction(_) => ModelType::Transaction,
            Self::TransactionDrop(_) => ModelType::TransactionDrop,
            Self::Reorg(_) => ModelType::Reorg,
            Self::FinalizedCheckpoint(_) => ModelType::FinalizedCheckpoint,
            Self::HeadEvent(_) => ModelType::HeadEvent,
            Self::ValidatorRewardsAggregation(_) => ModelType::ValidatorRewardsAggregation,
            Self::ValidatorRewardsAggregationDrop(_) => {
                ModelType::ValidatorRewardsAggregationDrop
            }
            Self::Slashing(_) => ModelType::Slashing,
            Self::SlashingDrop(_) => ModelType::SlashingDrop,
            Self::BlsToExecutionChange(_) => ModelType::BlsToExecutionChange,
            Self::BlsToExecutionChangeDrop(_) => ModelType::BlsToExecutionChangeDrop,
            Self::Deposit(_) => ModelType::Deposit,
            Self::DepositDrop(_) => ModelType::DepositDrop,
            Self::Eth1Deposit(_) => ModelType::Eth1Deposit,
            Self::Eth1DepositDrop(_) => ModelType::Eth1DepositDrop,
        }
    }

    /// The slot or epoch a drop shares with the rows it deletes.
    ///
    /// Models with equal keys are persisted in the order they were emitted.
    /// Validator statuses are keyed by validator because their upsert ignores older epochs.
    #[must_use]
    pub const fn ordering_key(&self) -> u64 {
        match self {
            Self::Block(record) | Self::Orphan(record) => record.block.slot,
            Self::Withdrawal(WithdrawalRecord { slot, .. })
            | Self::Transaction(TransactionRecord { slot, .. })
            | Self::Slashing(SlashingRecord { slot, .. })
            | Self::BlsToExecutionChange(BlsToExecutionChangeRecord { slot, .. })
            | Self::Deposit(DepositRecord { slot, .. })
            | Self::Eth1Deposit(Eth1DepositRecord { slot, .. })
            | Self::Reorg(ChainReorgEvent { slot, .. })
            | Self::HeadEvent(HeadEvent { slot, .. })
            | Self::BlockDrop(slot)
            | Self::WithdrawalDrop(slot)
            | Self::TransactionDrop(slot)
            | Self::SlashingDrop(slot)
            | Self::BlsToExecutionChangeDrop(slot)
            | Self::DepositDrop(slot)
            | Self::Eth1DepositDrop(slot) => *slot,
            Self::Epoch(EpochRecord { epoch, .. })
            | Self::PoolSummary(PoolSummary { epoch, .. })
            | Self::ProposerDuty(ProposerDutyRecord { epoch, .. })
            | Self::ValidatorRewards(ValidatorRewards { epoch, .. })
            | Self::FinalizedCheckpoint(FinalizedCheckpointEvent { epoch, .. })
            | Self::ValidatorRewardsAggregation(ValidatorRewardsAggregation {
                start_epoch: epoch,
                ..
            })
            | Self::EpochDrop(epoch)
            | Self::ProposerDutyDrop(epoch)
            | Self::ValidatorRewardsDrop(epoch)
            | Self::ValidatorRewardsAggregationDrop(epoch) => *epoch,
            Self::ValidatorLastStatus(status) => status.validator_index,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockRecord {
    pub epoch: Epoch,
    pub timestamp: UnixSeconds,
    pub block: NormalizedBlock,
    /// Proposer reward reported by the node. Absent for missed slots.
    pub rewards: Option<BlockRewards>,
}

/// A block that was fetched for a slot and later found not to be canonical.
/// Stored with the same columns as [`BlockRecord`] in a separate table.
pub type OrphanRecord = BlockRecord;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct EpochRecord {
    pub epoch: Epoch,
    /// Slot of the state the record was computed from.
    pub slot: Slot,
    pub active_validators: usize,
    pub total_active_balance: Gwei,
    pub total_effective_balance: Gwei,
    pub total_balance: Gwei,
    pub source_attesting_balance: Gwei,
    pub target_attesting_balance: Gwei,
    pub head_attesting_balance: Gwei,
    pub missing_source: usize,
    pub missing_target: usize,
    pub missing_head: usize,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
}

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct PoolSummary {
    pub pool_name: String,
    pub epoch: Epoch,
    pub validators: usize,
    pub reward: GweiDelta,
    pub max_reward: Gwei,
    pub effective_balance: Gwei,
    pub missing_source: usize,
    pub missing_target: usize,
    pub missing_head: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProposerDutyRecord {
    pub epoch: Epoch,
    pub slot: Slot,
    pub validator_index: ValidatorIndex,
    pub proposed: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValidatorLastStatus {
    pub validator_index: ValidatorIndex,
    pub epoch: Epoch,
    pub balance: Gwei,
    pub effective_balance: Gwei,
    pub status: ValidatorStatus,
    pub slashed: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ValidatorRewards {
    pub validator_index: ValidatorIndex,
    pub epoch: Epoch,
    pub balance: Gwei,
    pub effective_balance: Gwei,
    /// Balance change over the epoch, with withdrawals and slashing penalties added back.
    pub reward: GweiDelta,
    pub max_reward: Gwei,
    pub max_attestation_reward: Gwei,
    pub max_sync_reward: Gwei,
    pub max_proposer_reward: Gwei,
    pub base_reward: Gwei,
    pub in_sync_committee: bool,
    pub proposed_slots: u64,
    pub missing_source: bool,
    pub missing_target: bool,
    pub missing_head: bool,
    pub status: ValidatorStatus,
    /// Sum of node-reported rewards of the blocks this validator proposed in the epoch.
    pub block_api_reward: Gwei,
    pub withdrawn: Gwei,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WithdrawalRecord {
    pub slot: Slot,
    pub withdrawal: Withdrawal,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TransactionRecord {
    pub slot: Slot,
    pub block_number: ExecutionBlockNumber,
    pub timestamp: UnixSeconds,
    pub transaction: Transaction,
}

/// Sums of [`ValidatorRewards`] over a window of consecutive epochs.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ValidatorRewardsAggregation {
    pub validator_index: ValidatorIndex,
    pub start_epoch: Epoch,
    pub end_epoch: Epoch,
    /// Number of epochs in the window that had rewards computed.
    pub epochs: u64,
    pub reward: GweiDelta,
    pub max_reward: Gwei,
    pub max_attestation_reward: Gwei,
    pub max_sync_reward: Gwei,
    pub max_proposer_reward: Gwei,
    pub sync_committee_epochs: u64,
    pub proposed_slots: u64,
    pub missing_source: u64,
    pub missing_target: u64,
    pub missing_head: u64,
    pub block_api_reward: Gwei,
    pub withdrawn: Gwei,
}

impl ValidatorRewardsAggregation {
    #[must_use]
    pub const fn new(
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        end_epoch: Epoch,
    ) -> Self {
        Self {
            validator_index,
            start_epoch,
            end_epoch,
            epochs: 0,
            reward: 0,
            max_reward: 0,
            max_attestation_reward: 0,
            max_sync_reward: 0,
            max_proposer_reward: 0,
            sync_committee_epochs: 0,
            proposed_slots: 0,
            missing_source: 0,
            missing_target: 0,
            missing_head: 0,
            block_api_reward: 0,
            withdrawn: 0,
        }
    }

    pub fn add(&mut self, rewards: &ValidatorRewards) {
        self.epochs += 1;
        self.reward += rewards.reward;
        self.max_reward += rewards.max_reward;
        self.max_attestation_reward += rewards.max_attestation_reward;
        self.max_sync_reward += rewards.max_sync_reward;
        self.max_proposer_reward += rewards.max_proposer_reward;
        self.sync_committee_epochs += u64::from(rewards.in_sync_committee);
        self.proposed_slots += rewards.proposed_slots;
        self.missing_source += u64::from(rewards.missing_source);
        self.missing_target += u64::from(rewards.missing_target);
        self.missing_head += u64::from(rewards.missing_head);
        self.block_api_reward += rewards.block_api_reward;
        self.withdrawn += rewards.withdrawn;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlashingRecord {
    pub slot: Slot,
    pub epoch: Epoch,
    /// Proposer of the block that included the slashing.
    pub slashed_by: ValidatorIndex,
    pub slashing: Slashing,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlsToExecutionChangeRecord {
    pub slot: Slot,
    pub epoch: Epoch,
    pub change: BlsToExecutionChange,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DepositRecord {
    pub slot: Slot,
    pub epoch: Epoch,
    /// Position of the deposit in the block body.
    pub position: usize,
    pub deposit: Deposit,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Eth1DepositRecord {
    /// Slot of the beacon block whose execution payload emitted the deposit.
    pub slot: Slot,
    pub timestamp: UnixSeconds,
    pub deposit: Eth1Deposit,
}
