use enum_map::Enum;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    AsRefStr,
    Display,
    EnumString,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Phase {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
    Fulu,
}

impl Phase {
    /// Participation flags replaced pending attestations in Altair.
    #[must_use]
    pub fn has_participation_flags(self) -> bool {
        self >= Self::Altair
    }

    #[must_use]
    pub fn has_withdrawals(self) -> bool {
        self >= Self::Capella
    }
}

/// Lifecycle stage of a validator as of some epoch.
///
/// The discriminants are persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Enum, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ValidatorStatus {
    Queue = 0,
    Active = 1,
    Exit = 2,
    Slashed = 3,
}

impl ValidatorStatus {
    #[must_use]
    pub const fn code(self) -> i64 {
        self as i64
    }
}
