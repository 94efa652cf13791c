use core::ops::{Range, RangeInclusive};
use std::collections::HashSet;

use types::{
    config::Config,
    consts::GENESIS_SLOT,
    primitives::{Epoch, Slot, UnixSeconds, ValidatorIndex},
};

#[must_use]
pub const fn compute_epoch_at_slot(config: &Config, slot: Slot) -> Epoch {
    slot / config.slots_per_epoch.get()
}

#[must_use]
pub const fn compute_start_slot_at_epoch(config: &Config, epoch: Epoch) -> Slot {
    epoch.saturating_mul(config.slots_per_epoch.get())
}

#[must_use]
pub const fn compute_end_slot_at_epoch(config: &Config, epoch: Epoch) -> Slot {
    compute_start_slot_at_epoch(config, epoch.saturating_add(1)).saturating_sub(1)
}

/// Whether `slot` is the last slot of its epoch.
///
/// The state at this slot holds the complete participation of the epoch
/// before it and is the one rewards are computed from.
#[must_use]
pub const fn is_epoch_boundary(config: &Config, slot: Slot) -> bool {
    (slot + 1) % config.slots_per_epoch.get() == 0
}

#[must_use]
pub const fn slots_in_epoch(config: &Config, epoch: Epoch) -> Range<Slot> {
    compute_start_slot_at_epoch(config, epoch)..compute_start_slot_at_epoch(config, epoch + 1)
}

/// Boundary slots of every epoch that ends inside `slots`.
pub fn boundary_slots_in(
    config: &Config,
    slots: RangeInclusive<Slot>,
) -> impl Iterator<Item = Slot> + '_ {
    slots.filter(|slot| is_epoch_boundary(config, *slot))
}

/// The last slot of the epoch before `finalized_epoch`.
///
/// Finalized checkpoints point at the first slot of an epoch.
/// The state that closes the previous epoch is the one analyzed for it.
#[must_use]
pub const fn finalized_end_slot(config: &Config, finalized_epoch: Epoch) -> Option<Slot> {
    compute_start_slot_at_epoch(config, finalized_epoch).checked_sub(1)
}

#[must_use]
pub const fn compute_timestamp_at_slot(
    config: &Config,
    genesis_time: UnixSeconds,
    slot: Slot,
) -> UnixSeconds {
    let slots_since_genesis = slot - GENESIS_SLOT;
    genesis_time + slots_since_genesis * config.seconds_per_slot.get()
}

/// Validators present in both attestations of an attester slashing.
///
/// Only those validators signed conflicting votes and are slashed by the operation.
#[must_use]
pub fn slashing_intersection(
    attesting_indices_1: &[ValidatorIndex],
    attesting_indices_2: &[ValidatorIndex],
) -> Vec<ValidatorIndex> {
    let second = attesting_indices_2.iter().collect::<HashSet<_>>();

    let mut intersection = attesting_indices_1
        .iter()
        .copied()
        .filter(|index| second.contains(index))
        .collect::<Vec<_>>();

    intersection.sort_unstable();
    intersection.dedup();
    intersection
}
