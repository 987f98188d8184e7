mod cli;
mod config;
mod emit;
mod error;
mod fstab;
mod host;
mod inventory;
mod util;

use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use clap::Parser;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::cli::AutochrootCli;

const LOG_ENV: &str = "AUTOCHROOT_LOG";

fn main() -> color_eyre::Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}

	color_eyre::install()?;
	let cli = AutochrootCli::parse();
	init_logging(&cli);
	tracing::trace!(?cli, "Parsed arguments");

	cli::run(cli)
}

fn init_logging(cli: &AutochrootCli) {
	// default to info level logging, override with AUTOCHROOT_LOG env var
	let level = if cli.verbose { "debug" } else { "info" };
	let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));

	// stdout may carry the generated script
	let fmtlyr = fmt::layer().pretty().with_writer(std::io::stderr).with_filter(filter());

	let mut file_err: Option<(PathBuf, std::io::Error)> = None;
	let filelyr = if cli.no_log_file {
		None
	} else {
		match OpenOptions::new().create(true).append(true).open(&cli.log_file) {
			Ok(file) => Some(
				fmt::layer().with_ansi(false).with_writer(Mutex::new(file)).with_filter(filter()),
			),
			Err(e) => {
				file_err = Some((cli.log_file.clone(), e));
				None
			},
		}
	};

	let subscriber = Registry::default()
		.with(tracing_error::ErrorLayer::default())
		.with(fmtlyr)
		.with(filelyr);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

	if let Some((path, err)) = file_err {
		warn!(?path, %err, "Cannot open log file, logging to console only");
	}
}
