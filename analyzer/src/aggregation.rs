use core::num::NonZeroU64;
use std::collections::BTreeMap;

use log::{debug, warn};
use types::{
    models::{Model, ValidatorRewards, ValidatorRewardsAggregation},
    primitives::{Epoch, ValidatorIndex},
};

/// Sums validator rewards over aligned windows of epochs.
///
/// A window covering epochs `start..=end` is emitted when its last epoch is added.
/// Windows left before their last epoch are discarded, so a run covering part of a window
/// never replaces an aggregation written by a run that covered all of it.
/// Every emission is preceded by a drop of the window, so the last epoch can be replaced
/// by adding it again.
pub struct RewardsAggregator {
    epochs: NonZeroU64,
    window: Option<Window>,
}

struct Window {
    start: Epoch,
    end: Epoch,
    // Sums of every epoch in the window except the latest.
    base: BTreeMap<ValidatorIndex, ValidatorRewardsAggregation>,
    latest_epoch: Epoch,
    latest: Vec<ValidatorRewards>,
}

impl RewardsAggregator {
    #[must_use]
    pub const fn new(epochs: NonZeroU64) -> Self {
        Self {
            epochs,
            window: None,
        }
    }

    /// Adds the rewards of `epoch` and returns the records to emit.
    pub fn add(&mut self, epoch: Epoch, rewards: &[ValidatorRewards]) -> Vec<Model> {
        let epochs = self.epochs.get();
        let start = epoch - epoch % epochs;
        let mut models = vec![];

        match &mut self.window {
            Some(window) if window.start == start => {
                if epoch < window.latest_epoch {
                    warn!(
                        "rewards of epoch {epoch} are not aggregated again: \
                         epoch {} was already added",
                        window.latest_epoch,
                    );
                    return models;
                }

                if epoch > window.latest_epoch {
                    window.fold_latest();
                }

                window.latest_epoch = epoch;
                window.latest = rewards.to_vec();

                if epoch == window.end {
                    models.extend(window.records());
                }

                return models;
            }
            Some(window) if window.start > start => {
                warn!(
                    "rewards of epoch {epoch} are not aggregated: \
                     window starting at epoch {} is open",
                    window.start,
                );
                return models;
            }
            _ => {}
        }

        if let Some(window) = &self.window {
            if window.latest_epoch < window.end {
                debug!(
                    "discarding incomplete rewards aggregation of epochs {}..={}",
                    window.start, window.end,
                );
            }
        }

        let window = Window {
            start,
            end: start + (epochs - 1),
            base: BTreeMap::new(),
            latest_epoch: epoch,
            latest: rewards.to_vec(),
        };

        if epoch == window.end {
            models.extend(window.records());
        }

        self.window = Some(window);

        models
    }
}

impl Window {
    fn fold_latest(&mut self) {
        for rewards in core::mem::take(&mut self.latest) {
            self.base
                .entry(rewards.validator_index)
                .or_insert_with(|| {
                    ValidatorRewardsAggregation::new(rewards.validator_index, self.start, self.end)
                })
                .add(&rewards);
        }
    }

    fn records(&self) -> Vec<Model> {
        let mut totals = self.base.clone();

        for rewards in &self.latest {
            totals
                .entry(rewards.validator_index)
                .or_insert_with(|| {
                    ValidatorRewardsAggregation::new(rewards.validator_index, self.start, self.end)
                })
                .add(rewards);
        }

        core::iter::once(Model::ValidatorRewardsAggregationDrop(self.start))
            .chain(totals.into_values().map(Model::ValidatorRewardsAggregation))
            .collect()
    }
}
