//! Renders the resolved mount plan, either as a staging script or as JSON.

use std::path::Path;

use itertools::Itertools;
use serde_derive::Serialize;
use tracing::{debug, info};

use crate::{
	cli::OutputFormat,
	config::Config,
	error::Result,
	fstab::MountEntry,
	util::{just_write, shell_quote, write_executable},
};

crate::prepend_comment!(SCRIPT_PREPEND_COMMENT: "perform-chroot.sh", "chroot staging script", autochroot::emit::render_script);

/// Writes to stdout instead of a file.
pub const STDOUT: &str = "-";

#[derive(Serialize, Debug)]
struct TplMount {
	source: String,
	target: String,
	fstype: String,
	options: String,
}

#[derive(Serialize, Debug)]
struct TplUnlock {
	index: usize,
	mapper: String,
	underlying: String,
}

#[derive(Serialize, Debug)]
struct TplPending {
	source: String,
}

#[derive(Serialize, Debug)]
struct TplBind {
	source: String,
	target: String,
	fstype: String,
	bind: bool,
	optional: bool,
}

/// Renders the staging script for `entries`, which must already be in mount order.
///
/// Values are shell-quoted here, so the template only concatenates words.
pub fn render_script(entries: &[MountEntry], config: &Config, fstab: &Path) -> Result<String> {
	let mounts: Vec<_> = entries
		.iter()
		.map(|entry| TplMount {
			source: shell_quote(&entry.mount_source()),
			target: shell_quote(&entry.mount_point),
			fstype: shell_quote(&entry.fs_type),
			options: shell_quote_nonempty(&entry.mount_options(&config.strip_options).join(",")),
		})
		.collect();

	// several btrfs subvolumes can live in one container, unlock it once
	let unlocks: Vec<_> = entries
		.iter()
		.filter_map(|entry| Some((entry.mapper_name()?, entry.underlying_device.as_deref()?)))
		.unique_by(|(mapper, _)| mapper.clone())
		.enumerate()
		.map(|(index, (mapper, underlying))| TplUnlock {
			index,
			mapper: shell_quote(&mapper),
			underlying: shell_quote(underlying),
		})
		.collect();

	let pending: Vec<_> = entries
		.iter()
		.filter(|entry| entry.is_encrypted && entry.underlying_device.is_none())
		.map(MountEntry::mount_source)
		.unique()
		.map(|source| TplPending { source: shell_quote(&source) })
		.collect();

	let binds: Vec<_> = config
		.binds
		.iter()
		.map(|b| TplBind {
			source: shell_quote(&b.source),
			target: shell_quote(&b.target),
			fstype: shell_quote(b.fstype.as_deref().unwrap_or("auto")),
			bind: b.bind,
			optional: b.optional,
		})
		.collect();

	let root = shell_quote(&config.root.to_string_lossy());
	let shell = shell_quote(&config.shell);
	let fstab: String = fstab.display().to_string().chars().filter(|c| !c.is_control()).collect();

	debug!(mounts = mounts.len(), unlocks = unlocks.len(), binds = binds.len(), "Rendering script");
	crate::tpl!("../templates/perform-chroot.sh.tera" => {
		SCRIPT_PREPEND_COMMENT, fstab, root, shell, unlocks, pending, mounts, binds
	})
}

/// The ordered entries as pretty JSON.
pub fn render_json(entries: &[MountEntry]) -> Result<String> {
	Ok(serde_json::to_string_pretty(entries)?)
}

/// Writes the rendered output. Scripts are made executable.
pub fn write_output(path: &Path, rendered: &str, format: OutputFormat) -> Result<()> {
	if path.as_os_str() == STDOUT {
		print!("{rendered}");
		return Ok(());
	}
	match format {
		OutputFormat::Script => write_executable(path, rendered)?,
		OutputFormat::Json => just_write(path, rendered)?,
	}
	info!(?path, "Output written");
	Ok(())
}

fn shell_quote_nonempty(value: &str) -> String {
	if value.is_empty() {
		String::new()
	} else {
		shell_quote(value)
	}
}
