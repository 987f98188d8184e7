use std::path::PathBuf;

use clap::{value_parser, Parser};
use color_eyre::{
	eyre::{eyre, WrapErr},
	Report, Result, Section,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::{
	config::Config,
	emit,
	error::Error,
	fstab::{Resolver, DEFAULT_FSTAB},
	host::SystemHost,
};

pub const DEFAULT_LOG_FILE: &str = "/var/log/autochroot.log";
const DEFAULT_OUTPUT: &str = "perform-chroot.sh";

/// Reads a mount table and writes a script that mounts it under a staging
/// root and chroots into it.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct AutochrootCli {
	#[arg(short, long, default_value = "false")]
	pub verbose: bool,

	/// Mount table to resolve
	#[arg(long, env = "AUTOCHROOT_FSTAB", default_value = DEFAULT_FSTAB)]
	pub fstab: PathBuf,

	/// Output file, `-` for stdout
	#[arg(short, long, default_value = DEFAULT_OUTPUT)]
	pub output: PathBuf,

	#[arg(short, long, value_parser = value_parser!(OutputFormat), default_value = "script")]
	pub format: OutputFormat,

	/// Override the staging root
	#[arg(short, long)]
	pub root: Option<PathBuf>,

	/// Config file location
	#[arg(short, long)]
	pub config: Option<PathBuf>,

	/// List btrfs subvolumes and warn about the ones the mount table names but
	/// the device lacks. Mounts devices read-only, needs root.
	#[arg(long)]
	pub verify_subvolumes: bool,

	/// Don't re-run through sudo
	#[arg(long)]
	pub no_escalate: bool,

	#[arg(long, env = "AUTOCHROOT_LOG_FILE", default_value = DEFAULT_LOG_FILE)]
	pub log_file: PathBuf,

	/// Log to the console only
	#[arg(long)]
	pub no_log_file: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
	Script,
	Json,
}

impl std::str::FromStr for OutputFormat {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"script" | "sh" => Ok(Self::Script),
			"json" => Ok(Self::Json),
			_ => Err(format!("{s} is not a valid output format")),
		}
	}
}

#[tracing::instrument(skip_all)]
pub fn run(cli: AutochrootCli) -> Result<()> {
	if !cli.no_escalate {
		sudo::escalate_if_needed().map_err(|e| eyre!("cannot escalate privileges: {e}"))?;
	}

	let mut config = match &cli.config {
		Some(path) => Config::load(path).wrap_err("Cannot load config")?,
		None => Config::default(),
	};

	// check for overrides

	if let Some(root) = cli.root {
		config.root = root;
	}

	trace!(?config, "Loaded config");

	let host = SystemHost;
	let resolver = Resolver::new(&host);
	let entries = match resolver.parse_mount_table(&cli.fstab) {
		Err(e @ Error::MountTableNotFound(_)) => {
			return Err(Report::new(e)
				.suggestion("Point --fstab at the mount table of the system you want to enter"));
		},
		res => res?,
	};
	if entries.is_empty() {
		warn!(fstab = ?cli.fstab, "No mountable entries found");
	}
	info!(count = entries.len(), fstab = ?cli.fstab, "Resolved mount table");

	if cli.verify_subvolumes {
		let missing = resolver.verify_subvolumes(&entries);
		if missing.is_empty() {
			info!("All btrfs subvolumes present");
		} else {
			warn!(count = missing.len(), "Mounts of missing subvolumes will fail");
		}
	}

	let rendered = match cli.format {
		OutputFormat::Script => emit::render_script(&entries, &config, &cli.fstab)?,
		OutputFormat::Json => emit::render_json(&entries)?,
	};
	emit::write_output(&cli.output, &rendered, cli.format)?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn output_format_from_str() {
		assert_eq!("script".parse::<OutputFormat>(), Ok(OutputFormat::Script));
		assert_eq!("sh".parse::<OutputFormat>(), Ok(OutputFormat::Script));
		assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
		assert_eq!(
			"yaml".parse::<OutputFormat>(),
			Err("yaml is not a valid output format".to_owned())
		);
	}

	#[test]
	fn flags_override_defaults() {
		let cli = AutochrootCli::try_parse_from([
			"autochroot",
			"--fstab",
			"/mnt/target/etc/fstab",
			"-o",
			"-",
			"-f",
			"json",
			"-r",
			"/mnt/rescue",
			"--verify-subvolumes",
			"--no-escalate",
			"--no-log-file",
		])
		.unwrap();
		assert_eq!(cli.fstab, PathBuf::from("/mnt/target/etc/fstab"));
		assert_eq!(cli.output, PathBuf::from(emit::STDOUT));
		assert_eq!(cli.format, OutputFormat::Json);
		assert_eq!(cli.root, Some(PathBuf::from("/mnt/rescue")));
		assert!(cli.verify_subvolumes && cli.no_escalate && cli.no_log_file);
		assert!(!cli.verbose);
	}

	#[test]
	fn invalid_format_is_rejected() {
		assert!(AutochrootCli::try_parse_from(["autochroot", "-f", "xml"]).is_err());
	}

	#[test]
	fn defaults() {
		let cli = AutochrootCli::try_parse_from(["autochroot", "-v"]).unwrap();
		assert!(cli.verbose);
		assert_eq!(cli.output, PathBuf::from(DEFAULT_OUTPUT));
		assert_eq!(cli.format, OutputFormat::Script);
		assert_eq!(cli.config, None);
		assert!(!cli.verify_subvolumes);
	}
}
