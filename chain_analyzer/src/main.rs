use core::future::Future;
use std::{process::ExitCode, sync::Arc};

use analyzer::{Analyzer, AnalyzerHandle, Pools};
use anyhow::Result;
use beacon_api::{
    AccessHeaders, BeaconNode, ExecutionNode, Fetcher, HttpBeaconNode, HttpClient,
    HttpExecutionNode,
};
use clap::{Error as ClapError, Parser as _};
use database::{PersistenceEngine, SqlitePool};
use log::{error, info, warn};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

use crate::{chain_analyzer_args::ChainAnalyzerArgs, chain_analyzer_config::ChainAnalyzerConfig};

mod chain_analyzer_args;
mod chain_analyzer_config;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    binary_utils::initialize_logger(module_path!(), cfg!(feature = "logger-always-write-style"))?;

    let config = ChainAnalyzerArgs::try_parse()?
        .try_into_config()
        .map_err(ChainAnalyzerArgs::clap_error)?;

    info!("starting chain analyzer");
    config.report();

    block_on(run(config))
}

async fn run(config: ChainAnalyzerConfig) -> Result<()> {
    let ChainAnalyzerConfig {
        chain_config,
        bn_endpoint,
        el_endpoint,
        access_headers,
        request_timeout,
        fetcher_options,
        analyzer_options,
        persistence_options,
        db_path,
        pools_file,
    } = config;

    let pools = match pools_file {
        Some(path) => Pools::load(path)?,
        None => Pools::default(),
    };

    // Cancelled on the second signal. Stops retries and rejects new records.
    // Records already queued are still written.
    let abort = CancellationToken::new();

    let beacon_node: Arc<dyn BeaconNode> = Arc::new(HttpBeaconNode::new(HttpClient::new(
        bn_endpoint,
        &access_headers,
        request_timeout,
    )?));

    let execution_node: Option<Arc<dyn ExecutionNode>> = match el_endpoint {
        Some(endpoint) => {
            let http = HttpClient::new(endpoint, &AccessHeaders::default(), request_timeout)?;
            let execution_node: Arc<dyn ExecutionNode> = Arc::new(HttpExecutionNode::new(http));
            Some(execution_node)
        }
        None => None,
    };

    let fetcher = Fetcher::new(
        Arc::clone(&chain_config),
        beacon_node,
        execution_node,
        fetcher_options,
        abort.clone(),
    )?;

    let pool = SqlitePool::open(db_path)?;
    let engine = PersistenceEngine::start(pool, persistence_options, abort.clone())?;

    let analyzer = Analyzer::new(
        chain_config,
        Arc::new(fetcher),
        engine.persister(),
        pools,
        analyzer_options,
    )?;

    let signals = tokio::spawn(handle_signals(analyzer.handle(), abort));

    let analysis = analyzer.run().await;

    info!("analysis stopped, writing queued records");

    let persistence_report = engine.finish().await;

    signals.abort();

    let persistence_report = persistence_report?;
    persistence_report.log();

    analysis?.log();

    Ok(())
}

async fn handle_signals(analyzer: AnalyzerHandle, abort: CancellationToken) -> Result<()> {
    let mut signals = Signals::new()?;

    signals.recv().await?;
    warn!("stopping after slots in progress are processed, signal again to stop immediately");
    analyzer.close();

    signals.recv().await?;
    warn!("stopping immediately, only records already queued are written");
    abort.cancel();

    Ok(())
}

struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    async fn recv(&mut self) -> Result<()> {
        #[cfg(unix)]
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }

        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        Ok(())
    }
}

fn block_on(future: impl Future<Output = Result<()>>) -> Result<()> {
    Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}
