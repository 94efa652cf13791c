//! Derived per-epoch records.
//!
//! Rewards for epoch `N` are computed from the boundary states at the end of epochs `N` and
//! `N + 1`. The later state holds the complete participation of epoch `N` in its
//! `previous_epoch_participation`, and the balance difference between the two states contains
//! the rewards for it along with sync committee and proposer rewards earned in epoch `N + 1`.

use std::collections::HashMap;

use helper_functions::{
    accessors::{
        compute_base_reward, flag_reward, get_base_reward_per_increment, max_proposer_reward,
        sync_participant_reward, total_active_balance, unslashed_participating_balance,
    },
    misc::compute_epoch_at_slot,
    predicates::{
        has_timely_head, has_timely_source, has_timely_target, is_active_validator,
        validator_status,
    },
};
use itertools::izip;
use types::{
    config::Config,
    consts::PARTICIPATION_FLAG_WEIGHTS,
    containers::{BlockRewards, NormalizedBlock, NormalizedState, ProposerDuty},
    models::{EpochRecord, ValidatorLastStatus, ValidatorRewards},
    primitives::{Epoch, Gwei, GweiDelta, ValidatorIndex},
};

/// What happened in the blocks between two boundary states.
#[derive(Default, Debug)]
pub struct EpochActivity {
    duties: HashMap<ValidatorIndex, u64>,
    proposals: HashMap<ValidatorIndex, u64>,
    withdrawn: HashMap<ValidatorIndex, Gwei>,
    block_api_rewards: HashMap<ValidatorIndex, Gwei>,
}

impl EpochActivity {
    pub fn new<'blocks>(
        duties: &[ProposerDuty],
        blocks: impl IntoIterator<Item = (&'blocks NormalizedBlock, Option<&'blocks BlockRewards>)>,
    ) -> Self {
        let mut activity = Self::default();

        for duty in duties {
            *activity.duties.entry(duty.validator_index).or_default() += 1;
        }

        for (block, rewards) in blocks {
            if !block.proposed {
                continue;
            }

            *activity.proposals.entry(block.proposer_index).or_default() += 1;

            if let Some(rewards) = rewards {
                *activity
                    .block_api_rewards
                    .entry(block.proposer_index)
                    .or_default() += rewards.total;
            }

            for withdrawal in block.withdrawals() {
                *activity
                    .withdrawn
                    .entry(withdrawal.validator_index)
                    .or_default() += withdrawal.amount;
            }
        }

        activity
    }

    fn duties(&self, validator_index: ValidatorIndex) -> u64 {
        self.duties.get(&validator_index).copied().unwrap_or_default()
    }

    fn proposals(&self, validator_index: ValidatorIndex) -> u64 {
        self.proposals.get(&validator_index).copied().unwrap_or_default()
    }

    fn withdrawn(&self, validator_index: ValidatorIndex) -> Gwei {
        self.withdrawn.get(&validator_index).copied().unwrap_or_default()
    }

    fn block_api_reward(&self, validator_index: ValidatorIndex) -> Gwei {
        self.block_api_rewards
            .get(&validator_index)
            .copied()
            .unwrap_or_default()
    }
}

/// Computes the rewards of every validator present in both states.
///
/// Validators deposited after `previous` are left out until the next epoch.
#[must_use]
pub fn validator_rewards(
    config: &Config,
    previous: &NormalizedState,
    next: &NormalizedState,
    activity: &EpochActivity,
) -> Vec<ValidatorRewards> {
    let epoch = compute_epoch_at_slot(config, previous.slot);
    let next_epoch = compute_epoch_at_slot(config, next.slot);

    let total_active_balance = total_active_balance(config, &next.validators, next_epoch);
    let base_reward_per_increment = get_base_reward_per_increment(config, total_active_balance);

    let participating_balances = PARTICIPATION_FLAG_WEIGHTS.map(|(flag_index, weight)| {
        let balance = unslashed_participating_balance(
            config,
            &next.validators,
            &next.previous_epoch_participation,
            flag_index,
            epoch,
        );

        (weight, balance)
    });

    let sync_reward_per_slot =
        sync_participant_reward(config, total_active_balance, base_reward_per_increment);

    let proposer_reward_per_slot =
        max_proposer_reward(config, total_active_balance, base_reward_per_increment);

    let mut sync_occurrences = HashMap::<ValidatorIndex, u64>::new();

    for validator_index in &next.current_sync_committee {
        *sync_occurrences.entry(*validator_index).or_default() += 1;
    }

    izip!(
        0..,
        &previous.validators,
        &previous.balances,
        &next.validators,
        &next.balances,
        &next.previous_epoch_participation,
    )
    .map(
        |(validator_index, previous_validator, previous_balance, validator, balance, flags)| {
            let eligible = is_active_validator(previous_validator, epoch);

            let base_reward = compute_base_reward(
                config,
                previous_validator.effective_balance,
                base_reward_per_increment,
            );

            let max_attestation_reward = if eligible && !validator.slashed {
                participating_balances
                    .iter()
                    .map(|(weight, participating_balance)| {
                        flag_reward(
                            config,
                            base_reward,
                            *weight,
                            *participating_balance,
                            total_active_balance,
                        )
                    })
                    .sum()
            } else {
                0
            };

            let sync_slots = sync_occurrences
                .get(&validator_index)
                .copied()
                .unwrap_or_default();

            let max_sync_reward =
                sync_reward_per_slot * config.slots_per_epoch.get() * sync_slots;

            let max_proposer_reward = proposer_reward_per_slot * activity.duties(validator_index);

            let withdrawn = activity.withdrawn(validator_index);

            let slashing_penalty = if validator.slashed && !previous_validator.slashed {
                previous_validator.effective_balance
                    / config.min_slashing_penalty_quotient_bellatrix.get()
            } else {
                0
            };

            let reward = gwei_delta(*balance + withdrawn + slashing_penalty)
                - gwei_delta(*previous_balance);

            ValidatorRewards {
                validator_index,
                epoch,
                balance: *balance,
                effective_balance: validator.effective_balance,
                reward,
                max_reward: max_attestation_reward + max_sync_reward + max_proposer_reward,
                max_attestation_reward,
                max_sync_reward,
                max_proposer_reward,
                base_reward,
                in_sync_committee: sync_slots > 0,
                proposed_slots: activity.proposals(validator_index),
                missing_source: eligible && !has_timely_source(*flags),
                missing_target: eligible && !has_timely_target(*flags),
                missing_head: eligible && !has_timely_head(*flags),
                status: validator_status(validator, next_epoch),
                block_api_reward: activity.block_api_reward(validator_index),
                withdrawn,
            }
        },
    )
    .collect()
}

/// Summarizes the participation of `epoch` as recorded in `state`.
///
/// `state` must be from the epoch after `epoch`.
#[must_use]
pub fn epoch_record(config: &Config, state: &NormalizedState, epoch: Epoch) -> EpochRecord {
    let [source_attesting_balance, target_attesting_balance, head_attesting_balance] =
        PARTICIPATION_FLAG_WEIGHTS.map(|(flag_index, _)| {
            unslashed_participating_balance(
                config,
                &state.validators,
                &state.previous_epoch_participation,
                flag_index,
                epoch,
            )
        });

    let mut record = EpochRecord {
        epoch,
        slot: state.slot,
        total_active_balance: total_active_balance(config, &state.validators, epoch),
        total_effective_balance: state
            .validators
            .iter()
            .map(|validator| validator.effective_balance)
            .sum(),
        total_balance: state.balances.iter().sum(),
        source_attesting_balance,
        target_attesting_balance,
        head_attesting_balance,
        justified_epoch: state.current_justified_checkpoint.epoch,
        finalized_epoch: state.finalized_checkpoint.epoch,
        ..EpochRecord::default()
    };

    for (validator, flags) in izip!(&state.validators, &state.previous_epoch_participation) {
        if !is_active_validator(validator, epoch) {
            continue;
        }

        record.active_validators += 1;
        record.missing_source += usize::from(!has_timely_source(*flags));
        record.missing_target += usize::from(!has_timely_target(*flags));
        record.missing_head += usize::from(!has_timely_head(*flags));
    }

    record
}

pub fn last_statuses<'state>(
    config: &'state Config,
    state: &'state NormalizedState,
) -> impl Iterator<Item = ValidatorLastStatus> + 'state {
    let epoch = compute_epoch_at_slot(config, state.slot);

    izip!(0.., &state.validators, &state.balances).map(move |(validator_index, validator, balance)| {
        ValidatorLastStatus {
            validator_index,
            epoch,
            balance: *balance,
            effective_balance: validator.effective_balance,
            status: validator_status(validator, epoch),
            slashed: validator.slashed,
        }
    })
}

fn gwei_delta(amount: Gwei) -> GweiDelta {
    // Total supply of ether in Gwei is far below `i64::MAX`.
    GweiDelta::try_from(amount).unwrap_or(GweiDelta::MAX)
}
