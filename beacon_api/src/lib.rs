pub use crate::{
    execution::HttpExecutionNode,
    fetcher::{
        ActiveRequests, Fetcher, FinalizedEndSlot, Options as FetcherOptions, SlotUnavailable,
    },
    http::{AccessHeaders, HttpBeaconNode, HttpClient},
    ids::{BlockId, StateId},
    node::{BeaconNode, EventStream, ExecutionNode, NodeError},
};

mod deposit_event;
mod events;
mod execution;
mod fetcher;
mod http;
mod ids;
mod node;
mod raw;
