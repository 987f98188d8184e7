use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

const DEFAULT_ROOT: &str = "/mnt";
const DEFAULT_SHELL: &str = "/bin/bash";

/// Settings for the generated staging script.
///
/// Every key is optional in the YAML file:
///
/// ```yaml
/// root: /mnt/rescue
/// shell: /bin/zsh
/// strip_options: [defaults, x-systemd.automount]
/// binds:
///   - { source: proc, target: /proc, fstype: proc }
///   - { source: /dev, target: /dev, bind: true }
/// ```
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
	/// Staging root the filesystems are mounted under
	pub root: PathBuf,
	/// Shell started inside the chroot
	pub shell: String,
	/// Pseudo-filesystems mounted after the mount table entries
	pub binds: Vec<BindMount>,
	/// Mount options dropped from the generated `mount` calls
	pub strip_options: Vec<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			root: PathBuf::from(DEFAULT_ROOT),
			shell: DEFAULT_SHELL.to_owned(),
			binds: default_binds(),
			strip_options: vec!["defaults".to_owned()],
		}
	}
}

impl Config {
	/// Loads a config file. Keys missing from the file keep their defaults.
	pub fn load(path: &Path) -> Result<Self> {
		let contents = std::fs::read_to_string(path)?;
		let config: Self = serde_yaml::from_str(&contents)
			.map_err(|source| Error::Config { path: path.to_path_buf(), source })?;
		debug!(?path, ?config, "Loaded config");
		Ok(config)
	}
}

/// A pseudo-filesystem or bind mount set up inside the staging root.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BindMount {
	pub source: String,
	pub target: String,
	/// Filesystem type, for non-bind mounts
	#[serde(default)]
	pub fstype: Option<String>,
	#[serde(default)]
	pub bind: bool,
	/// Only mounted if `target` exists on the host
	#[serde(default)]
	pub optional: bool,
}

impl BindMount {
	fn fs(source: &str, target: &str, fstype: &str) -> Self {
		Self {
			source: source.to_owned(),
			target: target.to_owned(),
			fstype: Some(fstype.to_owned()),
			bind: false,
			optional: false,
		}
	}

	fn bind(path: &str) -> Self {
		Self {
			source: path.to_owned(),
			target: path.to_owned(),
			fstype: None,
			bind: true,
			optional: false,
		}
	}
}

fn default_binds() -> Vec<BindMount> {
	vec![
		BindMount::fs("proc", "/proc", "proc"),
		BindMount::fs("sys", "/sys", "sysfs"),
		BindMount::bind("/dev"),
		BindMount::bind("/dev/pts"),
		BindMount::bind("/run"),
		BindMount {
			optional: true,
			..BindMount::fs("efivarfs", "/sys/firmware/efi/efivars", "efivarfs")
		},
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_keeps_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("autochroot.yaml");
		std::fs::write(&path, "{}\n").unwrap();
		assert_eq!(Config::load(&path).unwrap(), Config::default());
	}

	#[test]
	fn partial_file_overrides_only_given_keys() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("autochroot.yaml");
		std::fs::write(
			&path,
			"root: /mnt/rescue\nbinds:\n  - { source: /dev, target: /dev, bind: true }\n",
		)
		.unwrap();
		let config = Config::load(&path).unwrap();
		assert_eq!(config.root, PathBuf::from("/mnt/rescue"));
		assert_eq!(config.shell, DEFAULT_SHELL);
		assert_eq!(config.binds, [BindMount::bind("/dev")]);
		assert_eq!(config.strip_options, ["defaults"]);
	}

	#[test]
	fn invalid_yaml_is_a_config_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("autochroot.yaml");
		std::fs::write(&path, "root: [unterminated\n").unwrap();
		assert!(matches!(Config::load(&path), Err(Error::Config { .. })));
	}

	#[test]
	fn default_binds_cover_pseudo_filesystems() {
		let targets: Vec<_> = default_binds().into_iter().map(|b| b.target).collect();
		assert_eq!(
			targets,
			["/proc", "/sys", "/dev", "/dev/pts", "/run", "/sys/firmware/efi/efivars"]
		);
	}
}
