//! Reward accessors.
//!
//! All amounts are integer Gwei and every division floors,
//! so results match the balances a node computes exactly.

use integer_sqrt::IntegerSquareRoot as _;
use itertools::izip;
use types::{
    config::Config,
    consts::{PARTICIPATION_FLAG_WEIGHTS, PROPOSER_WEIGHT, SYNC_REWARD_WEIGHT, WEIGHT_DENOMINATOR},
    containers::Validator,
    primitives::{Epoch, Gwei, ParticipationFlags},
};

use crate::predicates::{has_flag, is_active_unslashed, is_active_validator};

/// Sum of effective balances of validators active in `epoch`,
/// never less than one increment to avoid division by zero.
#[must_use]
pub fn total_active_balance(config: &Config, validators: &[Validator], epoch: Epoch) -> Gwei {
    let total = validators
        .iter()
        .filter(|validator| is_active_validator(validator, epoch))
        .map(|validator| validator.effective_balance)
        .sum();

    config.effective_balance_increment.get().max(total)
}

/// Balance of active unslashed validators that have `flag_index` set in `participation`.
#[must_use]
pub fn unslashed_participating_balance(
    config: &Config,
    validators: &[Validator],
    participation: &[ParticipationFlags],
    flag_index: usize,
    epoch: Epoch,
) -> Gwei {
    let total = izip!(validators, participation)
        .filter(|(validator, flags)| {
            is_active_unslashed(validator, epoch) && has_flag(**flags, flag_index)
        })
        .map(|(validator, _)| validator.effective_balance)
        .sum();

    config.effective_balance_increment.get().max(total)
}

#[must_use]
pub fn get_base_reward_per_increment(config: &Config, total_active_balance: Gwei) -> Gwei {
    config.effective_balance_increment.get() * config.base_reward_factor
        / total_active_balance.integer_sqrt()
}

#[must_use]
pub const fn compute_base_reward(
    config: &Config,
    effective_balance: Gwei,
    base_reward_per_increment: Gwei,
) -> Gwei {
    let increments = effective_balance / config.effective_balance_increment.get();
    increments * base_reward_per_increment
}

/// Reward for one timely flag given how much of the active balance set the same flag.
#[must_use]
pub const fn flag_reward(
    config: &Config,
    base_reward: Gwei,
    weight: u64,
    participating_balance: Gwei,
    total_active_balance: Gwei,
) -> Gwei {
    let increment = config.effective_balance_increment.get();
    let participating_increments = participating_balance / increment;
    let active_increments = total_active_balance / increment;

    base_reward * weight * participating_increments
        / (active_increments * WEIGHT_DENOMINATOR.get())
}

/// Reward one sync committee member earns for one slot of participation.
#[must_use]
pub const fn sync_participant_reward(
    config: &Config,
    total_active_balance: Gwei,
    base_reward_per_increment: Gwei,
) -> Gwei {
    let active_increments = total_active_balance / config.effective_balance_increment.get();
    let total_base_rewards = base_reward_per_increment * active_increments;

    let max_participant_rewards = total_base_rewards * SYNC_REWARD_WEIGHT
        / WEIGHT_DENOMINATOR.get()
        / config.slots_per_epoch.get();

    max_participant_rewards / config.sync_committee_size.get()
}

/// Upper bound of a proposer reward for one slot.
///
/// Assumes the block includes attestations covering an even share of the epoch's
/// attesters with all flags set and a fully participating sync aggregate.
#[must_use]
pub fn max_proposer_reward(
    config: &Config,
    total_active_balance: Gwei,
    base_reward_per_increment: Gwei,
) -> Gwei {
    let active_increments = total_active_balance / config.effective_balance_increment.get();
    let total_base_rewards = base_reward_per_increment * active_increments;
    let weight_sum = PARTICIPATION_FLAG_WEIGHTS
        .iter()
        .map(|(_, weight)| weight)
        .sum::<u64>();

    let proposer_reward_denominator =
        (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT) * WEIGHT_DENOMINATOR.get() / PROPOSER_WEIGHT;

    let attestations = total_base_rewards * weight_sum
        / config.slots_per_epoch.get()
        / proposer_reward_denominator;

    let participant_reward =
        sync_participant_reward(config, total_active_balance, base_reward_per_increment);

    let sync_aggregate = participant_reward * PROPOSER_WEIGHT
        / (WEIGHT_DENOMINATOR.get() - PROPOSER_WEIGHT)
        * config.sync_committee_size.get();

    attestations + sync_aggregate
}
