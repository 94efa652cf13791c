use types::{
    consts::{TIMELY_HEAD_FLAG_INDEX, TIMELY_SOURCE_FLAG_INDEX, TIMELY_TARGET_FLAG_INDEX},
    containers::Validator,
    nonstandard::ValidatorStatus,
    primitives::{Epoch, ParticipationFlags},
};

// > Check if ``validator`` is active.
#[must_use]
pub const fn is_active_validator(validator: &Validator, epoch: Epoch) -> bool {
    validator.activation_epoch <= epoch && epoch < validator.exit_epoch
}

#[must_use]
pub const fn is_active_unslashed(validator: &Validator, epoch: Epoch) -> bool {
    is_active_validator(validator, epoch) && !validator.slashed
}

#[must_use]
pub const fn has_flag(flags: ParticipationFlags, flag_index: usize) -> bool {
    flags & (1 << flag_index) != 0
}

#[must_use]
pub const fn has_timely_source(flags: ParticipationFlags) -> bool {
    has_flag(flags, TIMELY_SOURCE_FLAG_INDEX)
}

#[must_use]
pub const fn has_timely_target(flags: ParticipationFlags) -> bool {
    has_flag(flags, TIMELY_TARGET_FLAG_INDEX)
}

#[must_use]
pub const fn has_timely_head(flags: ParticipationFlags) -> bool {
    has_flag(flags, TIMELY_HEAD_FLAG_INDEX)
}

/// Slashing takes precedence over every other status.
#[must_use]
pub const fn validator_status(validator: &Validator, epoch: Epoch) -> ValidatorStatus {
    if validator.slashed {
        ValidatorStatus::Slashed
    } else if epoch < validator.activation_epoch {
        ValidatorStatus::Queue
    } else if epoch < validator.exit_epoch {
        ValidatorStatus::Active
    } else {
        ValidatorStatus::Exit
    }
}
