use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use types::{
    containers::{
        BlockRewards, Eth1Deposit, FinalityCheckpoints, NodeEvent, NormalizedBlock,
        NormalizedState, ProposerDuty, Transaction,
    },
    nonstandard::Phase,
    primitives::{Epoch, ExecutionAddress, ExecutionBlockNumber, Slot, UnixSeconds, H256},
};

use crate::ids::{BlockId, StateId};

pub type EventStream = BoxStream<'static, Result<NodeEvent, NodeError>>;

/// Consensus layer data source.
///
/// Implementations return normalized records and classify failures with [`NodeError`].
/// `Ok(None)` means the node does not have the requested object.
#[async_trait]
pub trait BeaconNode: Send + Sync {
    async fn genesis_time(&self) -> Result<UnixSeconds, NodeError>;

    async fn state(&self, state_id: StateId) -> Result<Option<NormalizedState>, NodeError>;

    async fn state_root(&self, state_id: StateId) -> Result<Option<H256>, NodeError>;

    async fn finality(&self, state_id: StateId) -> Result<FinalityCheckpoints, NodeError>;

    async fn block(&self, block_id: BlockId) -> Result<Option<NormalizedBlock>, NodeError>;

    async fn block_rewards(&self, slot: Slot) -> Result<Option<BlockRewards>, NodeError>;

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDuty>, NodeError>;

    async fn events(&self) -> Result<EventStream, NodeError>;
}

/// Execution layer data source.
#[async_trait]
pub trait ExecutionNode: Send + Sync {
    async fn transactions(
        &self,
        block_number: ExecutionBlockNumber,
    ) -> Result<Vec<Transaction>, NodeError>;

    /// `DepositEvent` logs emitted by `contract` in the given block.
    async fn deposits(
        &self,
        block_number: ExecutionBlockNumber,
        contract: ExecutionAddress,
    ) -> Result<Vec<Eth1Deposit>, NodeError>;
}

#[derive(Clone, Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum NodeError {
    #[error("request for {resource} timed out")]
    Timeout { resource: String },
    #[error("could not connect to node while requesting {resource}: {message}")]
    Connection { resource: String, message: String },
    #[error("node responded with status {status} to request for {resource}")]
    Status { resource: String, status: u16 },
    #[error("malformed response for {resource}: {message}")]
    Malformed { resource: String, message: String },
    #[error("{resource} is from {phase}, which predates participation flags")]
    UnsupportedPhase { resource: String, phase: Phase },
}

impl NodeError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Timeouts, dropped connections and gateway errors are transient.
    /// A response that cannot be normalized will not change on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Status { status, .. } => matches!(status, 502..=504),
            Self::Malformed { .. } | Self::UnsupportedPhase { .. } => false,
        }
    }

    pub(crate) fn malformed(resource: impl Into<String>, message: impl ToString) -> Self {
        Self::Malformed {
            resource: resource.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn status(status: u16) -> NodeError {
        NodeError::Status {
            resource: "state=31".to_owned(),
            status,
        }
    }

    #[test_case(NodeError::Timeout { resource: "state=31".to_owned() } => true)]
    #[test_case(status(503) => true)]
    #[test_case(status(504) => true)]
    #[test_case(status(500) => false)]
    #[test_case(status(400) => false)]
    #[test_case(NodeError::malformed("state=31", "missing field `slot`") => false)]
    fn transient_errors(error: NodeError) -> bool {
        error.is_transient()
    }
}
