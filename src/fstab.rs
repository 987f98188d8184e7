//! Mount table parsing and resolution.
//!
//! Turns `/etc/fstab` into an ordered list of [`MountEntry`] values, with
//! `UUID=` references resolved to device paths, LUKS wrapping detected and
//! btrfs subvolumes picked out of the options.

use std::{
	collections::BTreeMap,
	io::{BufRead, BufReader},
	path::Path,
};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
	error::{Error, Result},
	host::Host,
	inventory::{Inventory, MapperStatus, Snapshot},
};

pub const DEFAULT_FSTAB: &str = "/etc/fstab";

/// Mount points that never belong in a chroot staging plan.
const PSEUDO_TARGETS: &[&str] = &["none", "swap"];
/// Swap and in-memory filesystems.
const VOLATILE_FS: &[&str] = &["swap", "tmpfs", "proc", "sysfs", "devtmpfs"];
/// Kernel control filesystems.
const VIRTUAL_FS: &[&str] = &["cgroup", "cgroup2", "securityfs", "debugfs", "configfs"];
const DEVICE_PREFIXES: &[&str] = &["UUID=", "LABEL=", "/dev/", "PARTUUID=", "PARTLABEL="];

const MAPPER_PREFIX: &str = "/dev/mapper/";
const UUID_PREFIX: &str = "UUID=";
const SUBVOL_OPTION: &str = "subvol=";

/// Mount precedence for well-known mount points.
const FIXED_ORDER: &[(&str, u32)] = &[
	("/", 0),
	("/boot", 10),
	("/boot/efi", 11),
	("/home", 20),
	("/var", 21),
	("/usr", 22),
	("/opt", 23),
	("/tmp", 24),
];
const CUSTOM_ORDER_BASE: u32 = 30;

/// One resolved line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountEntry {
	/// Resolved device path, or the original token if it could not be resolved.
	pub device: String,
	pub mount_point: String,
	pub fs_type: String,
	pub options: Vec<String>,
	/// UUID the entry was keyed by, kept even when resolution failed.
	pub uuid: Option<String>,
	pub is_encrypted: bool,
	/// Raw device beneath the LUKS layer.
	pub underlying_device: Option<String>,
	pub subvolume: Option<String>,
	pub order: u32,
}

impl MountEntry {
	/// Name of the plaintext mapping for encrypted entries.
	///
	/// `/dev/mapper/<name>` entries keep their name. UUID-keyed containers are
	/// opened as `luks-<uuid>`, the name systemd-cryptsetup would pick.
	pub fn mapper_name(&self) -> Option<String> {
		if !self.is_encrypted {
			return None;
		}
		if let Some(name) = self.device.strip_prefix(MAPPER_PREFIX) {
			return Some(name.to_owned());
		}
		self.uuid.as_ref().map(|uuid| format!("luks-{uuid}"))
	}

	/// Device to hand to `mount`.
	pub fn mount_source(&self) -> String {
		match self.mapper_name() {
			Some(name) if !self.device.starts_with(MAPPER_PREFIX) => {
				format!("{MAPPER_PREFIX}{name}")
			},
			_ => self.device.clone(),
		}
	}

	/// Options with the no-op ones in `strip` removed.
	pub fn mount_options(&self, strip: &[String]) -> Vec<&str> {
		self.options
			.iter()
			.map(String::as_str)
			.filter(|opt| !opt.is_empty() && !strip.iter().any(|s| s == opt))
			.collect()
	}
}

/// Fields 1-4 of an accepted line, escapes already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
	pub device: String,
	pub mount_point: String,
	pub fs_type: String,
	pub options: Vec<String>,
}

/// Why a well-formed line was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
	/// Swap, `none` targets and in-memory filesystems.
	Volatile,
	Virtual,
	UnsupportedDevice,
}

/// Classification of a single mount table line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
	Blank,
	Comment,
	/// Fewer than four fields.
	Malformed,
	Rejected(Rejection),
	Accepted(RawEntry),
}

/// Checks whether a line is relevant to a chroot staging plan.
pub fn validate_entry(device: &str, mount_point: &str, fs_type: &str) -> Result<(), Rejection> {
	if PSEUDO_TARGETS.contains(&mount_point) || VOLATILE_FS.contains(&fs_type) {
		return Err(Rejection::Volatile);
	}
	if VIRTUAL_FS.contains(&fs_type) {
		return Err(Rejection::Virtual);
	}
	if !DEVICE_PREFIXES.iter().any(|prefix| device.starts_with(prefix)) {
		return Err(Rejection::UnsupportedDevice);
	}
	Ok(())
}

/// Splits and validates one line. Fields past the fourth are ignored.
pub fn classify_line(line: &str) -> LineOutcome {
	let line = line.trim();
	if line.is_empty() {
		return LineOutcome::Blank;
	}
	if line.starts_with('#') {
		return LineOutcome::Comment;
	}
	let mut fields = line.split_whitespace();
	let (Some(device), Some(mount_point), Some(fs_type), Some(options)) =
		(fields.next(), fields.next(), fields.next(), fields.next())
	else {
		return LineOutcome::Malformed;
	};

	let device = unescape_field(device);
	let mount_point = unescape_field(mount_point);
	if let Err(rejection) = validate_entry(&device, &mount_point, fs_type) {
		return LineOutcome::Rejected(rejection);
	}

	LineOutcome::Accepted(RawEntry {
		device,
		mount_point,
		fs_type: fs_type.to_owned(),
		options: options.split(',').map(str::to_owned).collect(),
	})
}

/// Decodes the octal escapes fstab(5) uses for blanks, e.g. `\040`.
///
/// Escapes are raw bytes, so a multi-byte UTF-8 character spans several of them.
fn unescape_field(input: &str) -> String {
	if !input.contains('\\') {
		return input.to_owned();
	}
	let bytes = input.as_bytes();
	let mut output = Vec::with_capacity(bytes.len());
	let mut idx = 0;
	while let Some(&byte) = bytes.get(idx) {
		let decoded = (byte == b'\\')
			.then(|| bytes.get(idx + 1..idx + 4))
			.flatten()
			.filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)))
			.and_then(|digits| std::str::from_utf8(digits).ok())
			.and_then(|digits| u8::from_str_radix(digits, 8).ok());
		match decoded {
			Some(value) => {
				output.push(value);
				idx += 4;
			},
			None => {
				output.push(byte);
				idx += 1;
			},
		}
	}
	String::from_utf8_lossy(&output).into_owned()
}

/// Mount precedence: fixed slots for well-known paths, then
/// `30 + number of '/'-separated segments` so parents sort before children.
#[must_use]
pub fn compute_order(mount_point: &str) -> u32 {
	FIXED_ORDER.iter().find(|(mp, _)| *mp == mount_point).map_or_else(
		|| {
			let segments = u32::try_from(mount_point.split('/').count()).unwrap_or(u32::MAX);
			CUSTOM_ORDER_BASE.saturating_add(segments)
		},
		|(_, order)| *order,
	)
}

/// Value of the first `subvol=` option.
pub fn extract_subvolume(options: &[String]) -> Option<&str> {
	options.iter().find_map(|opt| opt.strip_prefix(SUBVOL_OPTION))
}

/// Resolves mount tables against a device snapshot.
pub struct Resolver<'h, H: Host + ?Sized> {
	inventory: Inventory<'h, H>,
}

impl<'h, H: Host + ?Sized> Resolver<'h, H> {
	pub const fn new(host: &'h H) -> Self {
		Self { inventory: Inventory::new(host) }
	}

	/// Parses the mount table at `path`, ordered by mount precedence.
	///
	/// Only a missing or unreadable file is an error. Bad lines are logged and
	/// skipped.
	#[instrument(skip(self))]
	pub fn parse_mount_table(&self, path: &Path) -> Result<Vec<MountEntry>> {
		if !path.exists() {
			return Err(Error::MountTableNotFound(path.to_path_buf()));
		}
		let read_err = |source| Error::ReadMountTable { path: path.to_path_buf(), source };
		let file = std::fs::File::open(path).map_err(read_err)?;

		let snapshot = self.inventory.snapshot();

		let mut entries = vec![];
		for (idx, line) in BufReader::new(file).lines().enumerate() {
			let line = line.map_err(read_err)?;
			if let Some(entry) = self.process_line(&line, idx + 1, &snapshot) {
				entries.push(entry);
			}
		}

		// stable: ties keep file order
		entries.sort_by_key(|entry| entry.order);
		debug!(count = entries.len(), "Mount table parsed");
		Ok(entries)
	}

	fn process_line(&self, line: &str, line_no: usize, snapshot: &Snapshot) -> Option<MountEntry> {
		let raw = match classify_line(line) {
			LineOutcome::Blank | LineOutcome::Comment => return None,
			LineOutcome::Malformed => {
				warn!(line = line_no, content = line.trim(), "Invalid fstab line, fewer than 4 fields");
				return None;
			},
			LineOutcome::Rejected(Rejection::UnsupportedDevice) => {
				warn!(line = line_no, content = line.trim(), "Unsupported device reference");
				return None;
			},
			LineOutcome::Rejected(rejection) => {
				trace!(line = line_no, ?rejection, "Skipping fstab line");
				return None;
			},
			LineOutcome::Accepted(raw) => raw,
		};

		let entry = self.build_mount_entry(raw, snapshot);
		info!(line = line_no, mount_point = entry.mount_point, device = entry.device, "Mount point found");
		Some(entry)
	}

	/// Resolves the device reference of one accepted line.
	///
	/// Only `UUID=` and `/dev/mapper/` references are looked up. `LABEL=`,
	/// `PARTUUID=` and plain device paths pass through untouched, as does any
	/// reference that cannot be resolved.
	pub fn build_mount_entry(&self, raw: RawEntry, snapshot: &Snapshot) -> MountEntry {
		let RawEntry { device, mount_point, fs_type, options } = raw;
		let mut entry = MountEntry {
			order: compute_order(&mount_point),
			device,
			mount_point,
			fs_type,
			options,
			uuid: None,
			is_encrypted: false,
			underlying_device: None,
			subvolume: None,
		};

		if let Some(uuid) = entry.device.strip_prefix(UUID_PREFIX) {
			let uuid = uuid.to_owned();
			match snapshot.devices.find_by_uuid(&uuid) {
				Some(path) => entry.device = path.to_owned(),
				None => debug!(uuid, "UUID not found among block devices, keeping reference"),
			}
			if let Some(underlying) = snapshot.encryption.underlying(&uuid) {
				entry.is_encrypted = true;
				entry.underlying_device = Some(underlying.to_owned());
			}
			entry.uuid = Some(uuid);
		} else if let Some(name) = entry.device.strip_prefix(MAPPER_PREFIX) {
			let name = name.rsplit('/').next().unwrap_or_default();
			let status = if name.is_empty() {
				debug!(device = entry.device, "No mapper name, keeping reference");
				MapperStatus::default()
			} else {
				self.inventory.query_mapper_status(name)
			};
			if status.active {
				entry.is_encrypted = true;
				entry.underlying_device = status.underlying;
				if status.uuid.is_some() {
					entry.uuid = status.uuid;
				}
			}
		}

		if entry.fs_type == "btrfs" {
			entry.subvolume = extract_subvolume(&entry.options).map(str::to_owned);
		}

		entry
	}

	/// Returns the btrfs entries whose subvolume does not exist on their device.
	///
	/// Each device is listed once. Devices that cannot be listed are skipped
	/// rather than reported.
	#[instrument(skip_all)]
	pub fn verify_subvolumes<'e>(&self, entries: &'e [MountEntry]) -> Vec<&'e MountEntry> {
		let mut listed: BTreeMap<String, Vec<String>> = BTreeMap::new();
		let mut missing = vec![];
		for entry in entries {
			let Some(subvol) = entry.subvolume.as_deref() else { continue };
			let source = entry.mount_source();
			let known = listed
				.entry(source.clone())
				.or_insert_with(|| self.inventory.query_subvolumes(&source));
			if known.is_empty() {
				continue;
			}
			let wanted = subvol.trim_start_matches('/');
			if wanted.is_empty() {
				// the top-level subvolume always exists
				continue;
			}
			if !known.iter().any(|s| s.trim_start_matches('/') == wanted) {
				warn!(subvol, device = source, mount_point = entry.mount_point, "Subvolume not found");
				missing.push(entry);
			}
		}
		missing
	}
}
