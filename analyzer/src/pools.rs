use core::ops::RangeInclusive;
use std::{collections::BTreeMap, path::Path};

use anyhow::{ensure, Result};
use serde::Deserialize;
use thiserror::Error;
use types::{
    models::{PoolSummary, ValidatorRewards},
    primitives::{Epoch, ValidatorIndex},
};

pub const OTHERS: &str = "others";

/// Validator index ranges of staking pools.
///
/// Loaded from YAML mapping pool names to lists of inclusive ranges:
///
/// ```yaml
/// lido:
///   - { start: 0, end: 999 }
///   - { start: 5000, end: 5099 }
/// rocketpool:
///   - { start: 1000, end: 1999 }
/// ```
#[derive(Clone, Default, Debug, Deserialize)]
#[serde(transparent)]
pub struct Pools {
    ranges: BTreeMap<String, Vec<RangeInclusive<ValidatorIndex>>>,
}

impl Pools {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let pools = serde_yaml::from_str::<Self>(yaml)?;

        ensure!(
            !pools.ranges.contains_key(OTHERS),
            Error::ReservedName { name: OTHERS },
        );

        for (name, ranges) in &pools.ranges {
            for range in ranges {
                ensure!(
                    !range.is_empty(),
                    Error::EmptyRange {
                        name: name.clone(),
                        start: *range.start(),
                        end: *range.end(),
                    },
                );
            }
        }

        Ok(pools)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns the first pool containing `validator_index`, or [`OTHERS`].
    #[must_use]
    pub fn pool_of(&self, validator_index: ValidatorIndex) -> &str {
        self.ranges
            .iter()
            .find(|(_, ranges)| ranges.iter().any(|range| range.contains(&validator_index)))
            .map(|(name, _)| name.as_str())
            .unwrap_or(OTHERS)
    }

    /// Aggregates the rewards of `epoch` per pool.
    ///
    /// Pools without validators in `rewards` get no summary.
    #[must_use]
    pub fn summarize(&self, epoch: Epoch, rewards: &[ValidatorRewards]) -> Vec<PoolSummary> {
        let mut summaries = BTreeMap::<&str, PoolSummary>::new();

        for validator in rewards {
            let pool_name = self.pool_of(validator.validator_index);

            let summary = summaries.entry(pool_name).or_insert_with(|| PoolSummary {
                pool_name: pool_name.to_owned(),
                epoch,
                ..PoolSummary::default()
            });

            summary.validators += 1;
            summary.reward += validator.reward;
            summary.max_reward += validator.max_reward;
            summary.effective_balance += validator.effective_balance;
            summary.missing_source += usize::from(validator.missing_source);
            summary.missing_target += usize::from(validator.missing_target);
            summary.missing_head += usize::from(validator.missing_head);
        }

        summaries.into_values().collect()
    }
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("pool name {name} is reserved for validators outside every pool")]
    ReservedName { name: &'static str },
    #[error("pool {name} has an empty range {start}..={end}")]
    EmptyRange {
        name: String,
        start: ValidatorIndex,
        end: ValidatorIndex,
    },
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::NamedTempFile;
    use types::nonstandard::ValidatorStatus;

    use super::*;

    const POOLS: &str = "
        lido:
          - { start: 0, end: 9 }
          - { start: 20, end: 20 }
        rocketpool:
          - { start: 10, end: 14 }
    ";

    fn rewards(
        validator_index: ValidatorIndex,
        reward: i64,
        missing_head: bool,
    ) -> ValidatorRewards {
        ValidatorRewards {
            validator_index,
            epoch: 7,
            balance: 32_000_000_000,
            effective_balance: 32_000_000_000,
            reward,
            max_reward: 100,
            max_attestation_reward: 100,
            max_sync_reward: 0,
            max_proposer_reward: 0,
            base_reward: 10,
            in_sync_committee: false,
            proposed_slots: 0,
            missing_source: false,
            missing_target: false,
            missing_head,
            status: ValidatorStatus::Active,
            block_api_reward: 0,
            withdrawn: 0,
        }
    }

    #[test]
    fn validators_are_assigned_to_pools() -> Result<()> {
        let pools = Pools::from_yaml(POOLS)?;

        assert_eq!(pools.len(), 2);
        assert_eq!(pools.pool_of(0), "lido");
        assert_eq!(pools.pool_of(20), "lido");
        assert_eq!(pools.pool_of(12), "rocketpool");
        assert_eq!(pools.pool_of(15), OTHERS);

        Ok(())
    }

    #[test]
    fn summaries_aggregate_per_pool() -> Result<()> {
        let pools = Pools::from_yaml(POOLS)?;

        let summaries = pools.summarize(
            7,
            &[
                rewards(1, 90, false),
                rewards(2, -30, true),
                rewards(11, 100, false),
                rewards(40, 50, true),
            ],
        );

        let names = summaries
            .iter()
            .map(|summary| summary.pool_name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(names, ["lido", OTHERS, "rocketpool"]);

        let lido = &summaries[0];

        assert_eq!(lido.epoch, 7);
        assert_eq!(lido.validators, 2);
        assert_eq!(lido.reward, 60);
        assert_eq!(lido.max_reward, 200);
        assert_eq!(lido.effective_balance, 64_000_000_000);
        assert_eq!(lido.missing_head, 1);

        Ok(())
    }

    #[test]
    fn reserved_name_is_rejected() {
        let error = Pools::from_yaml("others: [{ start: 0, end: 1 }]")
            .expect_err("others is reserved")
            .downcast::<Error>()
            .expect("error should come from pool validation");

        assert_eq!(error, Error::ReservedName { name: OTHERS });
    }

    #[test]
    fn pools_are_loaded_from_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(POOLS.as_bytes())?;

        let pools = Pools::load(file.path())?;

        assert_eq!(pools.pool_of(14), "rocketpool");

        Ok(())
    }
}
