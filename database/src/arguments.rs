//! Conversion of records into positional statement arguments.
//!
//! Integers are stored as SQLite `INTEGER`, which is signed.
//! Roots, addresses and wei amounts are stored as text.

use anyhow::Result;
use itertools::Itertools as _;
use rusqlite::types::Value;
use thiserror::Error;
use types::{
    containers::{ChainReorgEvent, FinalizedCheckpointEvent, HeadEvent},
    models::{
        BlockRecord, BlsToExecutionChangeRecord, DepositRecord, EpochRecord, Eth1DepositRecord,
        Model, PoolSummary, ProposerDutyRecord, SlashingRecord, TransactionRecord,
        ValidatorLastStatus, ValidatorRewards, ValidatorRewardsAggregation, WithdrawalRecord,
    },
    primitives::{PublicKeyBytes, SignatureBytes, H160, H256, U256},
};

pub trait ToArguments {
    fn to_arguments(&self) -> Result<Vec<Value>>;
}

impl ToArguments for Model {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        match self {
            Self::Block(record) | Self::Orphan(record) => record.to_arguments(),
            Self::Epoch(record) => record.to_arguments(),
            Self::PoolSummary(summary) => summary.to_arguments(),
            Self::ProposerDuty(record) => record.to_arguments(),
            Self::ValidatorLastStatus(status) => status.to_arguments(),
            Self::ValidatorRewards(rewards) => rewards.to_arguments(),
            Self::Withdrawal(record) => record.to_arguments(),
            Self::Transaction(record) => record.to_arguments(),
            Self::Reorg(event) => event.to_arguments(),
            Self::FinalizedCheckpoint(event) => event.to_arguments(),
            Self::HeadEvent(event) => event.to_arguments(),
            Self::ValidatorRewardsAggregation(aggregation) => aggregation.to_arguments(),
            Self::Slashing(record) => record.to_arguments(),
            Self::BlsToExecutionChange(record) => record.to_arguments(),
            Self::Deposit(record) => record.to_arguments(),
            Self::Eth1Deposit(record) => record.to_arguments(),
            Self::BlockDrop(slot)
            | Self::WithdrawalDrop(slot)
            | Self::TransactionDrop(slot)
            | Self::SlashingDrop(slot)
            | Self::BlsToExecutionChangeDrop(slot)
            | Self::DepositDrop(slot)
            | Self::Eth1DepositDrop(slot) => Ok(vec![integer(*slot)?]),
            Self::EpochDrop(epoch)
            | Self::ProposerDutyDrop(epoch)
            | Self::ValidatorRewardsDrop(epoch)
            | Self::ValidatorRewardsAggregationDrop(epoch) => Ok(vec![integer(*epoch)?]),
        }
    }
}

impl ToArguments for BlockRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            epoch,
            timestamp,
            block,
            rewards,
        } = self;

        let payload = block.execution_payload.as_ref();

        Ok(vec![
            integer(block.slot)?,
            integer(*epoch)?,
            integer(*timestamp)?,
            root(block.root),
            root(block.parent_root),
            root(block.state_root),
            integer(block.proposer_index)?,
            boolean(block.proposed),
            root(block.graffiti),
            count(block.attestations)?,
            count(block.deposits.len())?,
            count(block.proposer_slashings)?,
            count(block.attester_slashings)?,
            count(block.voluntary_exits)?,
            count(block.bls_to_execution_changes.len())?,
            Value::Text(block.slashed_validators().iter().join(",")),
            count(block.sync_bits)?,
            optional(payload.map(|payload| root(payload.block_hash))),
            optional(payload.map(|payload| integer(payload.block_number)).transpose()?),
            optional(payload.map(|payload| address(payload.fee_recipient))),
            optional(payload.map(|payload| integer(payload.gas_limit)).transpose()?),
            optional(payload.map(|payload| integer(payload.gas_used)).transpose()?),
            optional(payload.map(|payload| wei(payload.base_fee_per_gas))),
            optional(payload.map(|payload| count(payload.transaction_count)).transpose()?),
            optional(payload.map(|payload| count(payload.transactions_size)).transpose()?),
            optional(payload.map(|payload| count(payload.withdrawals.len())).transpose()?),
            count(block.size.raw_bytes)?,
            count(block.size.compressed_bytes)?,
            integer(block.size.compression_micros)?,
            integer(block.size.decompression_micros)?,
            optional(rewards.map(|rewards| integer(rewards.total)).transpose()?),
        ])
    }
}

impl ToArguments for EpochRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.epoch)?,
            integer(self.slot)?,
            count(self.active_validators)?,
            integer(self.total_active_balance)?,
            integer(self.total_effective_balance)?,
            integer(self.total_balance)?,
            integer(self.source_attesting_balance)?,
            integer(self.target_attesting_balance)?,
            integer(self.head_attesting_balance)?,
            count(self.missing_source)?,
            count(self.missing_target)?,
            count(self.missing_head)?,
            integer(self.justified_epoch)?,
            integer(self.finalized_epoch)?,
        ])
    }
}

impl ToArguments for PoolSummary {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.pool_name.clone()),
            integer(self.epoch)?,
            count(self.validators)?,
            Value::Integer(self.reward),
            integer(self.max_reward)?,
            integer(self.effective_balance)?,
            count(self.missing_source)?,
            count(self.missing_target)?,
            count(self.missing_head)?,
        ])
    }
}

impl ToArguments for ProposerDutyRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.slot)?,
            integer(self.epoch)?,
            integer(self.validator_index)?,
            boolean(self.proposed),
        ])
    }
}

impl ToArguments for ValidatorLastStatus {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.validator_index)?,
            integer(self.epoch)?,
            integer(self.balance)?,
            integer(self.effective_balance)?,
            Value::Integer(self.status.code()),
            boolean(self.slashed),
        ])
    }
}

impl ToArguments for ValidatorRewards {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.validator_index)?,
            integer(self.epoch)?,
            integer(self.balance)?,
            integer(self.effective_balance)?,
            Value::Integer(self.reward),
            integer(self.max_reward)?,
            integer(self.max_attestation_reward)?,
            integer(self.max_sync_reward)?,
            integer(self.max_proposer_reward)?,
            integer(self.base_reward)?,
            boolean(self.in_sync_committee),
            integer(self.proposed_slots)?,
            boolean(self.missing_source),
            boolean(self.missing_target),
            boolean(self.missing_head),
            Value::Integer(self.status.code()),
            integer(self.block_api_reward)?,
            integer(self.withdrawn)?,
        ])
    }
}

impl ToArguments for ValidatorRewardsAggregation {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.validator_index)?,
            integer(self.start_epoch)?,
            integer(self.end_epoch)?,
            integer(self.epochs)?,
            Value::Integer(self.reward),
            integer(self.max_reward)?,
            integer(self.max_attestation_reward)?,
            integer(self.max_sync_reward)?,
            integer(self.max_proposer_reward)?,
            integer(self.sync_committee_epochs)?,
            integer(self.proposed_slots)?,
            integer(self.missing_source)?,
            integer(self.missing_target)?,
            integer(self.missing_head)?,
            integer(self.block_api_reward)?,
            integer(self.withdrawn)?,
        ])
    }
}

impl ToArguments for SlashingRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            slot,
            epoch,
            slashed_by,
            slashing,
        } = self;

        Ok(vec![
            integer(*slot)?,
            integer(*epoch)?,
            integer(slashing.validator_index)?,
            integer(*slashed_by)?,
            Value::Text(slashing.kind.as_ref().to_owned()),
        ])
    }
}

impl ToArguments for BlsToExecutionChangeRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            slot,
            epoch,
            change,
        } = self;

        Ok(vec![
            integer(*slot)?,
            integer(*epoch)?,
            integer(change.validator_index)?,
            public_key(change.from_bls_pubkey),
            address(change.to_execution_address),
        ])
    }
}

impl ToArguments for DepositRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            slot,
            epoch,
            position,
            deposit,
        } = self;

        Ok(vec![
            integer(*slot)?,
            integer(*epoch)?,
            count(*position)?,
            public_key(deposit.pubkey),
            root(deposit.withdrawal_credentials),
            integer(deposit.amount)?,
            signature(deposit.signature),
        ])
    }
}

impl ToArguments for Eth1DepositRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            slot,
            timestamp,
            deposit: event,
        } = self;

        let deposit = &event.deposit;

        Ok(vec![
            root(event.block_hash),
            integer(event.log_index)?,
            integer(*slot)?,
            integer(*timestamp)?,
            integer(event.block_number)?,
            root(event.transaction_hash),
            integer(event.index)?,
            public_key(deposit.pubkey),
            root(deposit.withdrawal_credentials),
            integer(deposit.amount)?,
            signature(deposit.signature),
        ])
    }
}

impl ToArguments for WithdrawalRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self { slot, withdrawal } = self;

        Ok(vec![
            integer(*slot)?,
            integer(withdrawal.index)?,
            integer(withdrawal.validator_index)?,
            address(withdrawal.address),
            integer(withdrawal.amount)?,
        ])
    }
}

impl ToArguments for TransactionRecord {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        let Self {
            slot,
            block_number,
            timestamp,
            transaction,
        } = self;

        Ok(vec![
            root(transaction.hash),
            integer(*slot)?,
            integer(*block_number)?,
            integer(*timestamp)?,
            integer(transaction.tx_type)?,
            optional(transaction.chain_id.map(integer).transpose()?),
            integer(transaction.nonce)?,
            integer(transaction.gas)?,
            optional(transaction.gas_price.map(wei)),
            optional(transaction.gas_tip_cap.map(wei)),
            optional(transaction.gas_fee_cap.map(wei)),
            wei(transaction.value),
            address(transaction.from),
            optional(transaction.to.map(address)),
            count(transaction.input_size)?,
        ])
    }
}

impl ToArguments for ChainReorgEvent {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.slot)?,
            integer(self.depth)?,
            root(self.old_head_block),
            root(self.new_head_block),
            root(self.old_head_state),
            root(self.new_head_state),
            integer(self.epoch)?,
        ])
    }
}

impl ToArguments for FinalizedCheckpointEvent {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![integer(self.epoch)?, root(self.block), root(self.state)])
    }
}

impl ToArguments for HeadEvent {
    fn to_arguments(&self) -> Result<Vec<Value>> {
        Ok(vec![
            integer(self.slot)?,
            root(self.block),
            root(self.state),
            boolean(self.epoch_transition),
        ])
    }
}

fn integer(value: u64) -> Result<Value> {
    let value = i64::try_from(value).map_err(|_| Error::IntegerOutOfRange { value })?;
    Ok(Value::Integer(value))
}

fn count(value: usize) -> Result<Value> {
    integer(value.try_into()?)
}

fn boolean(value: bool) -> Value {
    Value::Integer(value.into())
}

fn root(value: H256) -> Value {
    Value::Text(format!("{value:?}"))
}

fn address(value: H160) -> Value {
    Value::Text(format!("{value:?}"))
}

fn public_key(value: PublicKeyBytes) -> Value {
    Value::Text(format!("{value:?}"))
}

fn signature(value: SignatureBytes) -> Value {
    Value::Text(format!("{value:?}"))
}

fn wei(value: U256) -> Value {
    Value::Text(value.to_string())
}

fn optional(value: Option<Value>) -> Value {
    value.unwrap_or(Value::Null)
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("{value} does not fit in an SQLite integer")]
    IntegerOutOfRange { value: u64 },
}
