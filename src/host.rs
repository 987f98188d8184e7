//! Access to the live system: external commands and mounts.
//!
//! Everything the analysis learns about the machine goes through [`Host`], so
//! the inventory and resolver can be driven by canned outputs in tests.

use std::path::Path;

use sys_mount::{Mount, MountFlags, UnmountFlags};
use tracing::{debug, trace};

use crate::error::QueryFailed;

pub trait Host {
	/// Runs `program` with `args` and returns its trimmed stdout.
	///
	/// A non-zero exit status is a [`QueryFailed::Status`].
	fn run(&self, program: &str, args: &[&str]) -> Result<String, QueryFailed>;

	/// Mounts `device` read-only on `target`.
	fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<(), QueryFailed>;

	fn unmount(&self, target: &Path) -> Result<(), QueryFailed>;
}

/// The command line as it would be typed, used in logs and errors.
pub fn command_line(program: &str, args: &[&str]) -> String {
	std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
}

/// [`Host`] backed by the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
	fn run(&self, program: &str, args: &[&str]) -> Result<String, QueryFailed> {
		let command = command_line(program, args);
		debug!("# {command}");
		let out = std::process::Command::new(program)
			.args(args)
			.output()
			.map_err(|source| QueryFailed::Spawn { command: command.clone(), source })?;
		if out.status.success() {
			let stdout = String::from_utf8_lossy(&out.stdout).trim().to_owned();
			trace!(command, stdout, "Command succeeded");
			Ok(stdout)
		} else {
			Err(QueryFailed::Status {
				command,
				code: out.status.code().unwrap_or_default(),
				stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
			})
		}
	}

	fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<(), QueryFailed> {
		debug!(device, ?target, fstype, "mount -o ro");
		Mount::builder()
			.fstype(fstype)
			.flags(MountFlags::RDONLY)
			.mount(device, target)
			.map(drop)
			.map_err(|source| QueryFailed::Mount {
				device: device.to_owned(),
				target: target.to_path_buf(),
				source,
			})
	}

	fn unmount(&self, target: &Path) -> Result<(), QueryFailed> {
		debug!(?target, "umount");
		sys_mount::unmount(target, UnmountFlags::empty())
			.map_err(|source| QueryFailed::Unmount { target: target.to_path_buf(), source })
	}
}

#[cfg(test)]
pub mod fake {
	use std::{cell::RefCell, collections::BTreeMap, path::Path};

	use super::{command_line, Host};
	use crate::error::QueryFailed;

	/// Canned command outputs keyed by command line (or a prefix of it).
	#[derive(Debug, Default)]
	pub struct FakeHost {
		outputs: BTreeMap<String, Result<String, i32>>,
		calls: RefCell<Vec<String>>,
		fail_mount: bool,
	}

	impl FakeHost {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn with(mut self, command: &str, stdout: &str) -> Self {
			self.outputs.insert(command.to_owned(), Ok(stdout.to_owned()));
			self
		}

		pub fn failing(mut self, command: &str, code: i32) -> Self {
			self.outputs.insert(command.to_owned(), Err(code));
			self
		}

		pub fn refuse_mounts(mut self) -> Self {
			self.fail_mount = true;
			self
		}

		pub fn calls(&self) -> Vec<String> {
			self.calls.borrow().clone()
		}

		fn lookup(&self, command: &str) -> Option<&Result<String, i32>> {
			self.outputs.get(command).or_else(|| {
				self.outputs.iter().find(|(k, _)| command.starts_with(k.as_str())).map(|(_, v)| v)
			})
		}
	}

	impl Host for FakeHost {
		fn run(&self, program: &str, args: &[&str]) -> Result<String, QueryFailed> {
			let command = command_line(program, args);
			self.calls.borrow_mut().push(command.clone());
			match self.lookup(&command) {
				Some(Ok(stdout)) => Ok(stdout.clone()),
				Some(Err(code)) => {
					Err(QueryFailed::Status { command, code: *code, stderr: String::new() })
				},
				None => Err(QueryFailed::Spawn {
					command,
					source: std::io::Error::from(std::io::ErrorKind::NotFound),
				}),
			}
		}

		fn mount(&self, device: &str, target: &Path, _fstype: &str) -> Result<(), QueryFailed> {
			self.calls.borrow_mut().push(format!("mount {device}"));
			if self.fail_mount {
				return Err(QueryFailed::Mount {
					device: device.to_owned(),
					target: target.to_path_buf(),
					source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
				});
			}
			Ok(())
		}

		fn unmount(&self, _target: &Path) -> Result<(), QueryFailed> {
			self.calls.borrow_mut().push("umount".to_owned());
			Ok(())
		}
	}
}
