//! Beacon API response bodies and their normalization.
//!
//! Only the fields the analyzer reads are declared. Everything else in a response is ignored,
//! which keeps a single set of types working across all post-Altair phases.

use std::collections::HashMap;

use serde::{de::IgnoredAny, Deserialize};
use serde_with::{serde_as, DisplayFromStr};
use types::{
    containers::{
        BlockRewards, BlockSize, BlsToExecutionChange, ChainReorgEvent, Checkpoint, Deposit,
        ExecutionPayloadSummary, FinalityCheckpoints, FinalizedCheckpointEvent, HeadEvent,
        NormalizedBlock, NormalizedState, ProposerDuty, Slashing, SlashingKind, Validator,
        Withdrawal,
    },
    nonstandard::Phase,
    primitives::{
        Epoch, ExecutionAddress, ExecutionBlockHash, Gwei, ParticipationFlags, PublicKeyBytes,
        SignatureBytes, Slot, UnixSeconds, ValidatorIndex, Wei, WithdrawalIndex, H256,
    },
};

use crate::node::NodeError;

#[derive(Deserialize)]
pub struct Data<T> {
    pub data: T,
}

#[derive(Deserialize)]
pub struct Versioned<T> {
    pub version: Phase,
    pub data: T,
}

#[derive(Deserialize)]
pub struct RootResponse {
    pub root: H256,
}

#[serde_as]
#[derive(Clone, Copy, Deserialize)]
pub struct RawCheckpoint {
    #[serde_as(as = "DisplayFromStr")]
    epoch: Epoch,
    root: H256,
}

impl From<RawCheckpoint> for Checkpoint {
    fn from(raw: RawCheckpoint) -> Self {
        let RawCheckpoint { epoch, root } = raw;
        Self { epoch, root }
    }
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawState {
    #[serde_as(as = "DisplayFromStr")]
    genesis_time: UnixSeconds,
    #[serde_as(as = "DisplayFromStr")]
    slot: Slot,
    validators: Vec<RawValidator>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    balances: Vec<Gwei>,
    #[serde(default)]
    #[serde_as(as = "Option<Vec<DisplayFromStr>>")]
    previous_epoch_participation: Option<Vec<ParticipationFlags>>,
    #[serde(default)]
    #[serde_as(as = "Option<Vec<DisplayFromStr>>")]
    current_epoch_participation: Option<Vec<ParticipationFlags>>,
    #[serde(default)]
    current_sync_committee: Option<RawSyncCommittee>,
    current_justified_checkpoint: RawCheckpoint,
    finalized_checkpoint: RawCheckpoint,
}

#[serde_as]
#[derive(Deserialize)]
struct RawValidator {
    pubkey: String,
    #[serde_as(as = "DisplayFromStr")]
    effective_balance: Gwei,
    slashed: bool,
    #[serde_as(as = "DisplayFromStr")]
    activation_eligibility_epoch: Epoch,
    #[serde_as(as = "DisplayFromStr")]
    activation_epoch: Epoch,
    #[serde_as(as = "DisplayFromStr")]
    exit_epoch: Epoch,
    #[serde_as(as = "DisplayFromStr")]
    withdrawable_epoch: Epoch,
}

#[derive(Deserialize)]
struct RawSyncCommittee {
    pubkeys: Vec<String>,
}

/// Converts a state response into a [`NormalizedState`].
///
/// The state root is not part of the response body and is left zeroed.
pub fn normalize_state(
    resource: &str,
    response: Versioned<RawState>,
) -> Result<NormalizedState, NodeError> {
    let Versioned { version, data } = response;

    if !version.has_participation_flags() {
        return Err(NodeError::UnsupportedPhase {
            resource: resource.to_owned(),
            phase: version,
        });
    }

    let RawState {
        genesis_time,
        slot,
        validators,
        balances,
        previous_epoch_participation,
        current_epoch_participation,
        current_sync_committee,
        current_justified_checkpoint,
        finalized_checkpoint,
    } = data;

    let (Some(previous_epoch_participation), Some(current_epoch_participation)) =
        (previous_epoch_participation, current_epoch_participation)
    else {
        return Err(NodeError::malformed(
            resource,
            format_args!("{version} state is missing epoch participation"),
        ));
    };

    let validator_count = validators.len();

    for (name, length) in [
        ("balances", balances.len()),
        ("previous_epoch_participation", previous_epoch_participation.len()),
        ("current_epoch_participation", current_epoch_participation.len()),
    ] {
        if length != validator_count {
            return Err(NodeError::malformed(
                resource,
                format_args!("{name} has {length} entries but there are {validator_count} validators"),
            ));
        }
    }

    let current_sync_committee = match current_sync_committee {
        Some(committee) => resolve_pubkeys(resource, &validators, &committee.pubkeys)?,
        None => vec![],
    };

    let validators = validators
        .into_iter()
        .map(|raw| Validator {
            effective_balance: raw.effective_balance,
            slashed: raw.slashed,
            activation_eligibility_epoch: raw.activation_eligibility_epoch,
            activation_epoch: raw.activation_epoch,
            exit_epoch: raw.exit_epoch,
            withdrawable_epoch: raw.withdrawable_epoch,
        })
        .collect();

    Ok(NormalizedState {
        phase: version,
        slot,
        state_root: H256::zero(),
        genesis_time,
        validators,
        balances,
        previous_epoch_participation,
        current_epoch_participation,
        current_sync_committee,
        current_justified_checkpoint: current_justified_checkpoint.into(),
        finalized_checkpoint: finalized_checkpoint.into(),
    })
}

fn resolve_pubkeys(
    resource: &str,
    validators: &[RawValidator],
    pubkeys: &[String],
) -> Result<Vec<ValidatorIndex>, NodeError> {
    let indices = validators
        .iter()
        .zip(0..)
        .map(|(validator, index)| (validator.pubkey.to_lowercase(), index))
        .collect::<HashMap<_, ValidatorIndex>>();

    pubkeys
        .iter()
        .map(|pubkey| {
            indices.get(&pubkey.to_lowercase()).copied().ok_or_else(|| {
                NodeError::malformed(
                    resource,
                    format_args!("sync committee member {pubkey} is not in the registry"),
                )
            })
        })
        .collect()
}

#[derive(Deserialize)]
pub struct RawSignedBlock {
    message: RawBlock,
}

#[serde_as]
#[derive(Deserialize)]
struct RawBlock {
    #[serde_as(as = "DisplayFromStr")]
    slot: Slot,
    #[serde_as(as = "DisplayFromStr")]
    proposer_index: ValidatorIndex,
    parent_root: H256,
    state_root: H256,
    body: RawBlockBody,
}

#[derive(Deserialize)]
struct RawBlockBody {
    graffiti: H256,
    attestations: Vec<IgnoredAny>,
    deposits: Vec<RawDeposit>,
    proposer_slashings: Vec<RawProposerSlashing>,
    attester_slashings: Vec<RawAttesterSlashing>,
    voluntary_exits: Vec<IgnoredAny>,
    #[serde(default)]
    bls_to_execution_changes: Vec<RawSignedBlsToExecutionChange>,
    #[serde(default)]
    sync_aggregate: Option<RawSyncAggregate>,
    #[serde(default)]
    execution_payload: Option<RawExecutionPayload>,
}

#[derive(Deserialize)]
struct RawDeposit {
    data: RawDepositData,
}

#[serde_as]
#[derive(Deserialize)]
struct RawDepositData {
    pubkey: PublicKeyBytes,
    withdrawal_credentials: H256,
    #[serde_as(as = "DisplayFromStr")]
    amount: Gwei,
    signature: SignatureBytes,
}

impl From<RawDeposit> for Deposit {
    fn from(raw: RawDeposit) -> Self {
        let RawDepositData {
            pubkey,
            withdrawal_credentials,
            amount,
            signature,
        } = raw.data;

        Self {
            pubkey,
            withdrawal_credentials,
            amount,
            signature,
        }
    }
}

#[derive(Deserialize)]
struct RawSignedBlsToExecutionChange {
    message: RawBlsToExecutionChange,
}

#[serde_as]
#[derive(Deserialize)]
struct RawBlsToExecutionChange {
    #[serde_as(as = "DisplayFromStr")]
    validator_index: ValidatorIndex,
    from_bls_pubkey: PublicKeyBytes,
    to_execution_address: ExecutionAddress,
}

impl From<RawSignedBlsToExecutionChange> for BlsToExecutionChange {
    fn from(raw: RawSignedBlsToExecutionChange) -> Self {
        let RawBlsToExecutionChange {
            validator_index,
            from_bls_pubkey,
            to_execution_address,
        } = raw.message;

        Self {
            validator_index,
            from_bls_pubkey,
            to_execution_address,
        }
    }
}

#[derive(Deserialize)]
struct RawProposerSlashing {
    signed_header_1: RawSignedHeader,
}

#[derive(Deserialize)]
struct RawSignedHeader {
    message: RawHeader,
}

#[serde_as]
#[derive(Deserialize)]
struct RawHeader {
    #[serde_as(as = "DisplayFromStr")]
    proposer_index: ValidatorIndex,
}

#[derive(Deserialize)]
struct RawAttesterSlashing {
    attestation_1: RawIndexedAttestation,
    attestation_2: RawIndexedAttestation,
}

#[serde_as]
#[derive(Deserialize)]
struct RawIndexedAttestation {
    #[serde_as(as = "Vec<DisplayFromStr>")]
    attesting_indices: Vec<ValidatorIndex>,
}

#[derive(Deserialize)]
struct RawSyncAggregate {
    sync_committee_bits: String,
}

#[serde_as]
#[derive(Deserialize)]
struct RawExecutionPayload {
    fee_recipient: ExecutionAddress,
    block_hash: ExecutionBlockHash,
    #[serde_as(as = "DisplayFromStr")]
    block_number: u64,
    #[serde_as(as = "DisplayFromStr")]
    gas_limit: u64,
    #[serde_as(as = "DisplayFromStr")]
    gas_used: u64,
    #[serde_as(as = "DisplayFromStr")]
    timestamp: UnixSeconds,
    #[serde_as(as = "DisplayFromStr")]
    base_fee_per_gas: u128,
    transactions: Vec<String>,
    #[serde(default)]
    withdrawals: Vec<RawWithdrawal>,
}

#[serde_as]
#[derive(Deserialize)]
struct RawWithdrawal {
    #[serde_as(as = "DisplayFromStr")]
    index: WithdrawalIndex,
    #[serde_as(as = "DisplayFromStr")]
    validator_index: ValidatorIndex,
    address: ExecutionAddress,
    #[serde_as(as = "DisplayFromStr")]
    amount: Gwei,
}

pub fn normalize_block(
    resource: &str,
    root: H256,
    response: Versioned<RawSignedBlock>,
    size: BlockSize,
) -> Result<NormalizedBlock, NodeError> {
    let Versioned { version, data } = response;

    let RawBlock {
        slot,
        proposer_index,
        parent_root,
        state_root,
        body,
    } = data.message;

    let RawBlockBody {
        graffiti,
        attestations,
        deposits,
        proposer_slashings,
        attester_slashings,
        voluntary_exits,
        bls_to_execution_changes,
        sync_aggregate,
        execution_payload,
    } = body;

    let mut slashings = proposer_slashings
        .iter()
        .map(|slashing| Slashing {
            kind: SlashingKind::Proposer,
            validator_index: slashing.signed_header_1.message.proposer_index,
        })
        .collect::<Vec<_>>();

    for slashing in &attester_slashings {
        let intersection = helper_functions::misc::slashing_intersection(
            &slashing.attestation_1.attesting_indices,
            &slashing.attestation_2.attesting_indices,
        );

        slashings.extend(intersection.into_iter().map(|validator_index| Slashing {
            kind: SlashingKind::Attester,
            validator_index,
        }));
    }

    let sync_bits = match sync_aggregate {
        Some(aggregate) => count_bits(resource, &aggregate.sync_committee_bits)?,
        None => 0,
    };

    if version.has_withdrawals() && execution_payload.is_none() {
        return Err(NodeError::malformed(
            resource,
            format_args!("{version} block has no execution payload"),
        ));
    }

    let execution_payload = execution_payload.map(normalize_payload);

    Ok(NormalizedBlock {
        slot,
        root,
        parent_root,
        state_root,
        proposer_index,
        proposed: true,
        graffiti,
        attestations: attestations.len(),
        deposits: deposits.into_iter().map(Into::into).collect(),
        proposer_slashings: proposer_slashings.len(),
        attester_slashings: attester_slashings.len(),
        voluntary_exits: voluntary_exits.len(),
        bls_to_execution_changes: bls_to_execution_changes
            .into_iter()
            .map(Into::into)
            .collect(),
        slashings,
        sync_bits,
        execution_payload,
        size,
    })
}

fn normalize_payload(raw: RawExecutionPayload) -> ExecutionPayloadSummary {
    let RawExecutionPayload {
        fee_recipient,
        block_hash,
        block_number,
        gas_limit,
        gas_used,
        timestamp,
        base_fee_per_gas,
        transactions,
        withdrawals,
    } = raw;

    let transactions_size = transactions
        .iter()
        .map(|transaction| transaction.trim_start_matches("0x").len() / 2)
        .sum();

    let withdrawals = withdrawals
        .into_iter()
        .map(|raw| Withdrawal {
            index: raw.index,
            validator_index: raw.validator_index,
            address: raw.address,
            amount: raw.amount,
        })
        .collect();

    ExecutionPayloadSummary {
        block_hash,
        block_number,
        fee_recipient,
        gas_limit,
        gas_used,
        base_fee_per_gas: Wei::from(base_fee_per_gas),
        timestamp,
        transaction_count: transactions.len(),
        transactions_size,
        withdrawals,
    }
}

fn count_bits(resource: &str, bits: &str) -> Result<usize, NodeError> {
    let bytes = hex::decode(bits.trim_start_matches("0x"))
        .map_err(|error| NodeError::malformed(resource, error))?;

    Ok(bytes
        .iter()
        .map(|byte| byte.count_ones())
        .sum::<u32>()
        .try_into()
        .unwrap_or(usize::MAX))
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawGenesis {
    #[serde_as(as = "DisplayFromStr")]
    pub genesis_time: UnixSeconds,
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawBlockRewards {
    #[serde_as(as = "DisplayFromStr")]
    proposer_index: ValidatorIndex,
    #[serde_as(as = "DisplayFromStr")]
    total: Gwei,
    #[serde_as(as = "DisplayFromStr")]
    attestations: Gwei,
    #[serde_as(as = "DisplayFromStr")]
    sync_aggregate: Gwei,
    #[serde_as(as = "DisplayFromStr")]
    proposer_slashings: Gwei,
    #[serde_as(as = "DisplayFromStr")]
    attester_slashings: Gwei,
}

impl From<RawBlockRewards> for BlockRewards {
    fn from(raw: RawBlockRewards) -> Self {
        let RawBlockRewards {
            proposer_index,
            total,
            attestations,
            sync_aggregate,
            proposer_slashings,
            attester_slashings,
        } = raw;

        Self {
            proposer_index,
            total,
            attestations,
            sync_aggregate,
            proposer_slashings,
            attester_slashings,
        }
    }
}

#[derive(Deserialize)]
pub struct RawFinality {
    previous_justified: RawCheckpoint,
    current_justified: RawCheckpoint,
    finalized: RawCheckpoint,
}

impl From<RawFinality> for FinalityCheckpoints {
    fn from(raw: RawFinality) -> Self {
        Self {
            previous_justified: raw.previous_justified.into(),
            current_justified: raw.current_justified.into(),
            finalized: raw.finalized.into(),
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawProposerDuty {
    #[serde_as(as = "DisplayFromStr")]
    validator_index: ValidatorIndex,
    #[serde_as(as = "DisplayFromStr")]
    slot: Slot,
}

impl From<RawProposerDuty> for ProposerDuty {
    fn from(raw: RawProposerDuty) -> Self {
        Self {
            slot: raw.slot,
            validator_index: raw.validator_index,
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawHeadEvent {
    #[serde_as(as = "DisplayFromStr")]
    slot: Slot,
    block: H256,
    state: H256,
    epoch_transition: bool,
}

impl From<RawHeadEvent> for HeadEvent {
    fn from(raw: RawHeadEvent) -> Self {
        let RawHeadEvent {
            slot,
            block,
            state,
            epoch_transition,
        } = raw;

        Self {
            slot,
            block,
            state,
            epoch_transition,
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawChainReorgEvent {
    #[serde_as(as = "DisplayFromStr")]
    slot: Slot,
    #[serde_as(as = "DisplayFromStr")]
    depth: u64,
    old_head_block: H256,
    new_head_block: H256,
    old_head_state: H256,
    new_head_state: H256,
    #[serde_as(as = "DisplayFromStr")]
    epoch: Epoch,
}

impl From<RawChainReorgEvent> for ChainReorgEvent {
    fn from(raw: RawChainReorgEvent) -> Self {
        let RawChainReorgEvent {
            slot,
            depth,
            old_head_block,
            new_head_block,
            old_head_state,
            new_head_state,
            epoch,
        } = raw;

        Self {
            slot,
            depth,
            old_head_block,
            new_head_block,
            old_head_state,
            new_head_state,
            epoch,
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
pub struct RawFinalizedCheckpointEvent {
    block: H256,
    state: H256,
    #[serde_as(as = "DisplayFromStr")]
    epoch: Epoch,
}

impl From<RawFinalizedCheckpointEvent> for FinalizedCheckpointEvent {
    fn from(raw: RawFinalizedCheckpointEvent) -> Self {
        let RawFinalizedCheckpointEvent { block, state, epoch } = raw;
        Self { block, state, epoch }
    }
}
