use core::{num::NonZeroU64, time::Duration};
use std::borrow::Cow;

use hex_literal::hex;
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::primitives::{Epoch, ExecutionAddress, Gwei, Slot, UnixSeconds, H160};

/// Protocol parameters the analysis depends on.
///
/// Values are loaded from the same keys as the `consensus-specs` configuration and preset files,
/// so a merged YAML file for a custom network can be deserialized directly.
#[expect(
    clippy::unsafe_derive_deserialize,
    reason = "A false positive triggered by `nonzero!`. `Config` has no invariants."
)]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub config_name: Cow<'static, str>,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub min_genesis_time: UnixSeconds,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub seconds_per_slot: NonZeroU64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub slots_per_epoch: NonZeroU64,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub effective_balance_increment: NonZeroU64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub max_effective_balance: Gwei,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub base_reward_factor: u64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub sync_committee_size: NonZeroU64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub min_slashing_penalty_quotient_bellatrix: NonZeroU64,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub altair_fork_epoch: Epoch,

    pub deposit_contract_address: ExecutionAddress,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Config {
    #[must_use]
    pub const fn mainnet() -> Self {
        Self {
            config_name: Cow::Borrowed("mainnet"),
            min_genesis_time: 1_606_824_000,
            seconds_per_slot: nonzero!(12_u64),
            slots_per_epoch: nonzero!(32_u64),
            effective_balance_increment: nonzero!(1_000_000_000_u64),
            max_effective_balance: 32_000_000_000,
            base_reward_factor: 64,
            sync_committee_size: nonzero!(512_u64),
            min_slashing_penalty_quotient_bellatrix: nonzero!(32_u64),
            altair_fork_epoch: 74240,
            deposit_contract_address: H160(hex!("00000000219ab540356cBB839Cbe05303d7705Fa")),
        }
    }

    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config_name: Cow::Borrowed("minimal"),
            min_genesis_time: 1_578_009_600,
            seconds_per_slot: nonzero!(6_u64),
            slots_per_epoch: nonzero!(8_u64),
            sync_committee_size: nonzero!(32_u64),
            altair_fork_epoch: 0,
            deposit_contract_address: H160(hex!("1234567890123456789012345678901234567890")),
            ..Self::mainnet()
        }
    }

    #[must_use]
    pub const fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot.get())
    }

    #[must_use]
    pub const fn altair_fork_slot(&self) -> Slot {
        self.altair_fork_epoch
            .saturating_mul(self.slots_per_epoch.get())
    }
}
