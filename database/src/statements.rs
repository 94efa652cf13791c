use anyhow::Result;
use enum_map::{enum_map, EnumMap};
use rusqlite::types::Value;
use types::models::{Model, ModelType};

use crate::arguments::ToArguments as _;

const INSERT_BLOCK: &str = "
    INSERT INTO t_block_metrics (
        slot, epoch, timestamp, block_root, parent_root, state_root, proposer_index, proposed,
        graffiti, attestations, deposits, proposer_slashings, attester_slashings,
        voluntary_exits, bls_to_execution_changes, slashed_validators, sync_bits,
        el_block_hash, el_block_number, el_fee_recipient, el_gas_limit, el_gas_used,
        el_base_fee_per_gas, el_transactions, el_transactions_size, el_withdrawals, raw_size,
        compressed_size, compression_micros, decompression_micros, block_api_reward
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
        ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31
    ) ON CONFLICT DO NOTHING
";

const INSERT_ORPHAN: &str = "
    INSERT INTO t_orphans (
        slot, epoch, timestamp, block_root, parent_root, state_root, proposer_index, proposed,
        graffiti, attestations, deposits, proposer_slashings, attester_slashings,
        voluntary_exits, bls_to_execution_changes, slashed_validators, sync_bits,
        el_block_hash, el_block_number, el_fee_recipient, el_gas_limit, el_gas_used,
        el_base_fee_per_gas, el_transactions, el_transactions_size, el_withdrawals, raw_size,
        compressed_size, compression_micros, decompression_micros, block_api_reward
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
        ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31
    ) ON CONFLICT DO NOTHING
";

const INSERT_EPOCH: &str = "
    INSERT INTO t_epoch_metrics_summary (
        epoch, slot, active_validators, total_active_balance, total_effective_balance,
        total_balance, source_attesting_balance, target_attesting_balance,
        head_attesting_balance, missing_source, missing_target, missing_head, justified_epoch,
        finalized_epoch
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
    ON CONFLICT DO NOTHING
";

const UPSERT_POOL_SUMMARY: &str = "
    INSERT INTO t_pool_summary (
        pool_name, epoch, validators, reward, max_reward, effective_balance, missing_source,
        missing_target, missing_head
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT (pool_name, epoch) DO UPDATE SET
        validators = excluded.validators,
        reward = excluded.reward,
        max_reward = excluded.max_reward,
        effective_balance = excluded.effective_balance,
        missing_source = excluded.missing_source,
        missing_target = excluded.missing_target,
        missing_head = excluded.missing_head
";

const INSERT_PROPOSER_DUTY: &str = "
    INSERT INTO t_proposer_duties (slot, epoch, validator_index, proposed)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT DO NOTHING
";

// Older epochs never overwrite newer ones, so reprocessing after a reorg is safe.
const UPSERT_VALIDATOR_LAST_STATUS: &str = "
    INSERT INTO t_validator_last_status (
        validator_index, epoch, balance, effective_balance, status, slashed
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (validator_index) DO UPDATE SET
        epoch = excluded.epoch,
        balance = excluded.balance,
        effective_balance = excluded.effective_balance,
        status = excluded.status,
        slashed = excluded.slashed
    WHERE excluded.epoch >= t_validator_last_status.epoch
";

const INSERT_VALIDATOR_REWARDS: &str = "
    INSERT INTO t_validator_rewards_summary (
        validator_index, epoch, balance, effective_balance, reward, max_reward,
        max_attestation_reward, max_sync_reward, max_proposer_reward, base_reward,
        in_sync_committee, proposed_slots, missing_source, missing_target, missing_head, status,
        block_api_reward, withdrawn
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
    ) ON CONFLICT DO NOTHING
";

const INSERT_WITHDRAWAL: &str = "
    INSERT INTO t_withdrawals (slot, withdrawal_index, validator_index, address, amount)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT DO NOTHING
";

const INSERT_TRANSACTION: &str = "
    INSERT INTO t_transactions (
        hash, slot, block_number, timestamp, tx_type, chain_id, nonce, gas, gas_price,
        gas_tip_cap, gas_fee_cap, value, from_address, to_address, input_size
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
    ON CONFLICT DO NOTHING
";

const INSERT_REORG: &str = "
    INSERT INTO t_reorgs (
        slot, depth, old_head_block, new_head_block, old_head_state, new_head_state, epoch
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT DO NOTHING
";

const INSERT_FINALIZED_CHECKPOINT: &str = "
    INSERT INTO t_finalized_checkpoint (epoch, block_root, state_root)
    VALUES (?1, ?2, ?3)
    ON CONFLICT DO NOTHING
";

const INSERT_HEAD_EVENT: &str = "
    INSERT INTO t_head_events (slot, block_root, state_root, epoch_transition)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT DO NOTHING
";

const INSERT_VALIDATOR_REWARDS_AGGREGATION: &str = "
    INSERT INTO t_validator_rewards_aggregation (
        validator_index, start_epoch, end_epoch, epochs, reward, max_reward,
        max_attestation_reward, max_sync_reward, max_proposer_reward, sync_committee_epochs,
        proposed_slots, missing_source, missing_target, missing_head, block_api_reward, withdrawn
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
    ON CONFLICT DO NOTHING
";

const INSERT_SLASHING: &str = "
    INSERT INTO t_slashings (slot, epoch, validator_index, slashed_by, slashing_type)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT DO NOTHING
";

const INSERT_BLS_TO_EXECUTION_CHANGE: &str = "
    INSERT INTO t_bls_to_execution_changes (
        slot, epoch, validator_index, from_bls_pubkey, to_execution_address
    ) VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT DO NOTHING
";

const INSERT_DEPOSIT: &str = "
    INSERT INTO t_deposits (
        slot, epoch, position, pubkey, withdrawal_credentials, amount, signature
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT DO NOTHING
";

const INSERT_ETH1_DEPOSIT: &str = "
    INSERT INTO t_eth1_deposits (
        block_hash, log_index, slot, timestamp, block_number, transaction_hash, deposit_index,
        pubkey, withdrawal_credentials, amount, signature
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT DO NOTHING
";

const DROP_BLOCK: &str = "DELETE FROM t_block_metrics WHERE slot = ?1";
const DROP_EPOCH: &str = "DELETE FROM t_epoch_metrics_summary WHERE epoch = ?1";
const DROP_PROPOSER_DUTIES: &str = "DELETE FROM t_proposer_duties WHERE epoch = ?1";
const DROP_VALIDATOR_REWARDS: &str = "DELETE FROM t_validator_rewards_summary WHERE epoch = ?1";
const DROP_WITHDRAWALS: &str = "DELETE FROM t_withdrawals WHERE slot = ?1";
const DROP_TRANSACTIONS: &str = "DELETE FROM t_transactions WHERE slot = ?1";
const DROP_VALIDATOR_REWARDS_AGGREGATION: &str =
    "DELETE FROM t_validator_rewards_aggregation WHERE start_epoch = ?1";
const DROP_SLASHINGS: &str = "DELETE FROM t_slashings WHERE slot = ?1";
const DROP_BLS_TO_EXECUTION_CHANGES: &str =
    "DELETE FROM t_bls_to_execution_changes WHERE slot = ?1";
const DROP_DEPOSITS: &str = "DELETE FROM t_deposits WHERE slot = ?1";
const DROP_ETH1_DEPOSITS: &str = "DELETE FROM t_eth1_deposits WHERE slot = ?1";

/// A statement template together with its positional arguments.
#[derive(Clone, PartialEq, Debug)]
pub struct Statement {
    pub model_type: ModelType,
    pub sql: &'static str,
    pub arguments: Vec<Value>,
}

/// Maps every [`ModelType`] to the statement that persists it.
///
/// Drop models are ordinary entries. They differ from inserts only in their SQL.
pub struct StatementTable {
    templates: EnumMap<ModelType, &'static str>,
}

impl Default for StatementTable {
    fn default() -> Self {
        Self {
            templates: enum_map! {
                ModelType::Block => INSERT_BLOCK,
                ModelType::BlockDrop => DROP_BLOCK,
                ModelType::Orphan => INSERT_ORPHAN,
                ModelType::Epoch => INSERT_EPOCH,
                ModelType::EpochDrop => DROP_EPOCH,
                ModelType::PoolSummary => UPSERT_POOL_SUMMARY,
                ModelType::ProposerDuty => INSERT_PROPOSER_DUTY,
                ModelType::ProposerDutyDrop => DROP_PROPOSER_DUTIES,
                ModelType::ValidatorLastStatus => UPSERT_VALIDATOR_LAST_STATUS,
                ModelType::ValidatorRewards => INSERT_VALIDATOR_REWARDS,
                ModelType::ValidatorRewardsDrop => DROP_VALIDATOR_REWARDS,
                ModelType::Withdrawal => INSERT_WITHDRAWAL,
                ModelType::WithdrawalDrop => DROP_WITHDRAWALS,
                ModelType::Transaction => INSERT_TRANSACTION,
                ModelType::TransactionDrop => DROP_TRANSACTIONS,
                ModelType::Reorg => INSERT_REORG,
                ModelType::FinalizedCheckpoint => INSERT_FINALIZED_CHECKPOINT,
                ModelType::HeadEvent => INSERT_HEAD_EVENT,
                ModelType::ValidatorRewardsAggregation => INSERT_VALIDATOR_REWARDS_AGGREGATION,
                ModelType::ValidatorRewardsAggregationDrop => DROP_VALIDATOR_REWARDS_AGGREGATION,
                ModelType::Slashing => INSERT_SLASHING,
                ModelType::SlashingDrop => DROP_SLASHINGS,
                ModelType::BlsToExecutionChange => INSERT_BLS_TO_EXECUTION_CHANGE,
                ModelType::BlsToExecutionChangeDrop => DROP_BLS_TO_EXECUTION_CHANGES,
                ModelType::Deposit => INSERT_DEPOSIT,
                ModelType::DepositDrop => DROP_DEPOSITS,
                ModelType::Eth1Deposit => INSERT_ETH1_DEPOSIT,
                ModelType::Eth1DepositDrop => DROP_ETH1_DEPOSITS,
            },
        }
    }
}

impl StatementTable {
    pub fn build(&self, model: &Model) -> Result<Statement> {
        let model_type = model.model_type();

        Ok(Statement {
            model_type,
            sql: self.templates[model_type],
            arguments: model.to_arguments()?,
        })
    }
}
