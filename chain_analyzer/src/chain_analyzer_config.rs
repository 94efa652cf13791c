use core::time::Duration;
use std::{path::PathBuf, sync::Arc};

use analyzer::{AnalyzerOptions, DownloadMode};
use beacon_api::{AccessHeaders, FetcherOptions};
use database::PersistenceOptions;
use log::info;
use types::{config::Config as ChainConfig, redacting_url::RedactingUrl};

#[cfg_attr(test, derive(Debug))]
pub struct ChainAnalyzerConfig {
    pub chain_config: Arc<ChainConfig>,
    pub bn_endpoint: RedactingUrl,
    pub el_endpoint: Option<RedactingUrl>,
    pub access_headers: AccessHeaders,
    pub request_timeout: Duration,
    pub fetcher_options: FetcherOptions,
    pub analyzer_options: AnalyzerOptions,
    pub persistence_options: PersistenceOptions,
    pub db_path: PathBuf,
    pub pools_file: Option<PathBuf>,
}

impl ChainAnalyzerConfig {
    pub fn report(&self) {
        let Self {
            chain_config,
            bn_endpoint,
            el_endpoint,
            fetcher_options,
            analyzer_options,
            persistence_options,
            db_path,
            pools_file,
            ..
        } = self;

        info!("network: {}", chain_config.config_name);
        info!("beacon node: {bn_endpoint}");

        match el_endpoint {
            Some(el_endpoint) => {
                info!("execution node: {el_endpoint}");
                info!("deposit contract: {:?}", chain_config.deposit_contract_address);
            }
            None => info!(
                "no execution node given, transactions and deposit logs will not be downloaded",
            ),
        }

        match &analyzer_options.mode {
            DownloadMode::Historical { slots } => {
                info!("download mode: historical, slots {}..={}", slots.start(), slots.end());
            }
            DownloadMode::Head => info!("download mode: head"),
            DownloadMode::Hybrid { slots } => {
                info!("download mode: hybrid, slots {}..={}", slots.start(), slots.end());
            }
        }

        info!(
            "downloading {} slots ahead, at most {} states and {} blocks at once",
            analyzer_options.look_ahead,
            fetcher_options.state_book_size,
            fetcher_options.block_book_size,
        );

        info!(
            "requests are attempted {} times, {:?} apart",
            fetcher_options.max_retries, fetcher_options.retry_interval,
        );

        info!(
            "database: {db_path:?}, {} workers writing batches of {} statements",
            persistence_options.workers, persistence_options.batch_size,
        );

        if let Some(epochs) = analyzer_options.rewards_aggregation_epochs {
            info!("aggregating validator rewards over {epochs} epochs");
        }

        if let Some(pools_file) = pools_file {
            info!("staking pools: {pools_file:?}");
        }
    }
}
