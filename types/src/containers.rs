//! Fork-independent representations of chain data.
//!
//! Everything the analyzer consumes is normalized into these types by the node client,
//! so analysis code never matches on [`Phase`].

use strum::{AsRefStr, Display};

use crate::{
    consts::FAR_FUTURE_EPOCH,
    nonstandard::Phase,
    primitives::{
        DepositIndex, Epoch, ExecutionAddress, ExecutionBlockHash, ExecutionBlockNumber, Gwei,
        ParticipationFlags, PublicKeyBytes, SignatureBytes, Slot, UnixSeconds, ValidatorIndex,
        Wei, WithdrawalIndex, H256,
    },
};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: H256,
}

/// The parts of a validator record that matter for reward and status tracking.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Validator {
    pub effective_balance: Gwei,
    pub slashed: bool,
    pub activation_eligibility_epoch: Epoch,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
    pub withdrawable_epoch: Epoch,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            effective_balance: 0,
            slashed: false,
            activation_eligibility_epoch: FAR_FUTURE_EPOCH,
            activation_epoch: FAR_FUTURE_EPOCH,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        }
    }
}

/// Snapshot of a beacon state at one slot.
///
/// `validators`, `balances` and both participation lists are indexed by validator index and
/// always have the same length.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NormalizedState {
    pub phase: Phase,
    pub slot: Slot,
    pub state_root: H256,
    pub genesis_time: UnixSeconds,
    pub validators: Vec<Validator>,
    pub balances: Vec<Gwei>,
    pub previous_epoch_participation: Vec<ParticipationFlags>,
    pub current_epoch_participation: Vec<ParticipationFlags>,
    /// Members of the current sync committee, resolved from public keys.
    /// A validator may appear more than once.
    pub current_sync_committee: Vec<ValidatorIndex>,
    pub current_justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Withdrawal {
    pub index: WithdrawalIndex,
    pub validator_index: ValidatorIndex,
    pub address: ExecutionAddress,
    pub amount: Gwei,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExecutionPayloadSummary {
    pub block_hash: ExecutionBlockHash,
    pub block_number: ExecutionBlockNumber,
    pub fee_recipient: ExecutionAddress,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee_per_gas: Wei,
    pub timestamp: UnixSeconds,
    pub transaction_count: usize,
    /// Sum of the encoded sizes of all transactions in bytes.
    pub transactions_size: usize,
    pub withdrawals: Vec<Withdrawal>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SlashingKind {
    Proposer,
    Attester,
}

/// A validator slashed by an operation included in a block.
///
/// An attester slashing produces one entry for every validator
/// that signed both conflicting attestations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slashing {
    pub kind: SlashingKind,
    pub validator_index: ValidatorIndex,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Deposit {
    pub pubkey: PublicKeyBytes,
    pub withdrawal_credentials: H256,
    pub amount: Gwei,
    pub signature: SignatureBytes,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlsToExecutionChange {
    pub validator_index: ValidatorIndex,
    pub from_bls_pubkey: PublicKeyBytes,
    pub to_execution_address: ExecutionAddress,
}

/// A `DepositEvent` emitted by the deposit contract on the execution layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Eth1Deposit {
    pub block_number: ExecutionBlockNumber,
    pub block_hash: ExecutionBlockHash,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub deposit: Deposit,
    pub index: DepositIndex,
}

/// Encoding statistics of a block as served by the node.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BlockSize {
    pub raw_bytes: usize,
    pub compressed_bytes: usize,
    pub compression_micros: u64,
    pub decompression_micros: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NormalizedBlock {
    pub slot: Slot,
    pub root: H256,
    pub parent_root: H256,
    pub state_root: H256,
    pub proposer_index: ValidatorIndex,
    /// `false` for the placeholder standing in for a missed slot.
    pub proposed: bool,
    pub graffiti: H256,
    pub attestations: usize,
    pub deposits: Vec<Deposit>,
    pub proposer_slashings: usize,
    pub attester_slashings: usize,
    pub voluntary_exits: usize,
    pub bls_to_execution_changes: Vec<BlsToExecutionChange>,
    /// Validators slashed by the operations in this block, in inclusion order.
    pub slashings: Vec<Slashing>,
    pub sync_bits: usize,
    pub execution_payload: Option<ExecutionPayloadSummary>,
    pub size: BlockSize,
}

impl NormalizedBlock {
    #[must_use]
    pub fn missed(slot: Slot) -> Self {
        Self {
            slot,
            root: H256::zero(),
            parent_root: H256::zero(),
            state_root: H256::zero(),
            proposer_index: 0,
            proposed: false,
            graffiti: H256::zero(),
            attestations: 0,
            deposits: vec![],
            proposer_slashings: 0,
            attester_slashings: 0,
            voluntary_exits: 0,
            bls_to_execution_changes: vec![],
            slashings: vec![],
            sync_bits: 0,
            execution_payload: None,
            size: BlockSize::default(),
        }
    }

    /// Distinct indices of the validators slashed in this block in ascending order.
    #[must_use]
    pub fn slashed_validators(&self) -> Vec<ValidatorIndex> {
        let mut indices = self
            .slashings
            .iter()
            .map(|slashing| slashing.validator_index)
            .collect::<Vec<_>>();

        indices.sort_unstable();
        indices.dedup();
        indices
    }

    #[must_use]
    pub fn withdrawals(&self) -> &[Withdrawal] {
        self.execution_payload
            .as_ref()
            .map(|payload| payload.withdrawals.as_slice())
            .unwrap_or_default()
    }
}

/// Proposer reward breakdown as reported by the node.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BlockRewards {
    pub proposer_index: ValidatorIndex,
    pub total: Gwei,
    pub attestations: Gwei,
    pub sync_aggregate: Gwei,
    pub proposer_slashings: Gwei,
    pub attester_slashings: Gwei,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct FinalityCheckpoints {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProposerDuty {
    pub slot: Slot,
    pub validator_index: ValidatorIndex,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    pub hash: H256,
    pub tx_type: u64,
    pub chain_id: Option<u64>,
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: Option<Wei>,
    pub gas_tip_cap: Option<Wei>,
    pub gas_fee_cap: Option<Wei>,
    pub value: Wei,
    pub from: ExecutionAddress,
    pub to: Option<ExecutionAddress>,
    pub input_size: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeadEvent {
    pub slot: Slot,
    pub block: H256,
    pub state: H256,
    pub epoch_transition: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChainReorgEvent {
    pub slot: Slot,
    pub depth: u64,
    pub old_head_block: H256,
    pub new_head_block: H256,
    pub old_head_state: H256,
    pub new_head_state: H256,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FinalizedCheckpointEvent {
    pub block: H256,
    pub state: H256,
    pub epoch: Epoch,
}

/// Notifications from the node's event stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeEvent {
    Head(HeadEvent),
    ChainReorg(ChainReorgEvent),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
}
