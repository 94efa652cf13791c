use std::io::{IsTerminal as _, Write as _};

use anyhow::Result;
use chrono::{Local, SecondsFormat};
use env_logger::{Builder, WriteStyle};
use log::LevelFilter;

const LOG_ENVIRONMENT_VARIABLE: &str = "CHAIN_ANALYZER_LOG";

const WORKSPACE_CRATES: &[&str] = &[
    "analyzer",
    "beacon_api",
    "binary_utils",
    "database",
    "helper_functions",
    "request_book",
    "types",
];

pub fn initialize_logger(module_path: &str, always_write_style: bool) -> Result<()> {
    let mut builder = Builder::new();

    builder.filter_level(LevelFilter::Off);

    for crate_name in WORKSPACE_CRATES.iter().copied().chain([module_path]) {
        builder.filter_module(crate_name, LevelFilter::Info);
    }

    if let Ok(filters) = std::env::var(LOG_ENVIRONMENT_VARIABLE) {
        builder.parse_filters(&filters);
    }

    let write_style = if always_write_style || std::io::stderr().is_terminal() {
        WriteStyle::Always
    } else {
        WriteStyle::Never
    };

    builder
        .write_style(write_style)
        .format(|formatter, record| {
            let style = formatter.default_level_style(record.level());
            let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Millis, true);

            let target = record.line().map_or_else(
                || record.target().to_owned(),
                |line| format!("{}:{line}", record.target()),
            );

            writeln!(
                formatter,
                "[{timestamp}] {style}{:5}{style:#} {target}: {}",
                record.level(),
                record.args(),
            )
        })
        .try_init()?;

    Ok(())
}
