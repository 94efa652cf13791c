pub use crate::{
    analyzer::{Analyzer, AnalyzerHandle, AnalyzerPhase, DownloadMode, Options as AnalyzerOptions},
    boundary_cache::EpochBoundaryCache,
    pools::{Pools, OTHERS as OTHER_VALIDATORS_POOL},
    report::RunReport,
    sink::ModelSink,
};

mod aggregation;
mod analyzer;
mod boundary_cache;
mod pools;
mod report;
mod rewards;
mod sink;
