use log::{info, warn};
use types::primitives::{Epoch, Slot};

/// Outcome of an analyzer run.
#[derive(Clone, Default, Debug)]
pub struct RunReport {
    pub processed_slots: usize,
    pub processed_epochs: usize,
    /// Slots whose data could not be fetched or normalized. Their records are missing.
    pub skipped_slots: Vec<Slot>,
    /// Epochs whose boundary state could not be fetched. Their derived records are missing.
    pub skipped_epochs: Vec<Epoch>,
    pub orphans: usize,
    pub reorgs: usize,
}

impl RunReport {
    pub fn log(&self) {
        info!(
            "processed {} slots and {} epochs, detected {} orphaned blocks in {} reorgs",
            self.processed_slots, self.processed_epochs, self.orphans, self.reorgs,
        );

        if !self.skipped_slots.is_empty() {
            warn!(
                "skipped {} slots: {:?}",
                self.skipped_slots.len(),
                self.skipped_slots,
            );
        }

        if !self.skipped_epochs.is_empty() {
            warn!(
                "skipped {} epochs: {:?}",
                self.skipped_epochs.len(),
                self.skipped_epochs,
            );
        }
    }
}
