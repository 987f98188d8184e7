//! Best-effort snapshot of block devices and LUKS containers.
//!
//! Nothing in here fails the run. Every query has a `try_` form returning
//! [`QueryFailed`] and a plain form that logs the failure and degrades to an
//! empty (or partial) result.

use std::{
	path::Path,
	sync::LazyLock,
};

use bytesize::ByteSize;
use indexmap::IndexMap;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument, trace, warn};

use crate::{error::QueryFailed, host::Host};

const LSBLK_ARGS: &[&str] = &["-J", "-p", "-b", "-o", "NAME,UUID,FSTYPE,MOUNTPOINT,SIZE,TYPE"];
const LUKS_TYPE: &str = "crypto_LUKS";
const SCRATCH_PREFIX: &str = "autochroot-btrfs.";

/// blkid exits with 2 when no device matched the search token.
const BLKID_NO_MATCH: i32 = 2;

static BLKID_LUKS_LINE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(&format!(r#"^([^:]+):\s+UUID="([^"]+)".*TYPE="{LUKS_TYPE}""#))
		.expect("static regex")
});
static CRYPTSETUP_DEVICE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"device:\s+(/dev/\S+)").expect("static regex")
});
static SUBVOLUME_PATH: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"path\s+(.+)$").expect("static regex"));

/// Kind of block device, from lsblk's `TYPE` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
	Disk,
	Partition,
	Crypt,
	Mapper,
	Loop,
	Other(String),
}

impl From<&str> for DeviceClass {
	fn from(value: &str) -> Self {
		match value {
			"disk" => Self::Disk,
			"part" => Self::Partition,
			"crypt" => Self::Crypt,
			"lvm" | "dm" | "mpath" => Self::Mapper,
			"loop" => Self::Loop,
			other => Self::Other(other.to_owned()),
		}
	}
}

/// One block device as observed when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
	pub path: String,
	pub uuid: Option<String>,
	pub fstype: Option<String>,
	pub mountpoint: Option<String>,
	pub size: Option<ByteSize>,
	pub class: DeviceClass,
}

/// Flat view of the device tree, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInventory {
	devices: IndexMap<String, DeviceRecord>,
}

impl DeviceInventory {
	/// Path of the first device carrying `uuid`.
	pub fn find_by_uuid(&self, uuid: &str) -> Option<&str> {
		self.devices
			.values()
			.find(|dev| dev.uuid.as_deref() == Some(uuid))
			.map(|dev| dev.path.as_str())
	}

	pub fn len(&self) -> usize {
		self.devices.len()
	}

	pub fn is_empty(&self) -> bool {
		self.devices.is_empty()
	}

	/// Inserts a record unless its path is already known. The first record wins.
	fn insert(&mut self, record: DeviceRecord) {
		self.devices.entry(record.path.clone()).or_insert(record);
	}
}

impl FromIterator<DeviceRecord> for DeviceInventory {
	fn from_iter<T: IntoIterator<Item = DeviceRecord>>(iter: T) -> Self {
		let mut inventory = Self::default();
		iter.into_iter().for_each(|record| inventory.insert(record));
		inventory
	}
}

/// LUKS container UUID -> raw device hosting it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionMap {
	containers: IndexMap<String, String>,
}

impl EncryptionMap {
	pub fn underlying(&self, uuid: &str) -> Option<&str> {
		self.containers.get(uuid).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.containers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.containers.is_empty()
	}
}

impl<U: Into<String>, D: Into<String>> FromIterator<(U, D)> for EncryptionMap {
	fn from_iter<T: IntoIterator<Item = (U, D)>>(iter: T) -> Self {
		Self { containers: iter.into_iter().map(|(u, d)| (u.into(), d.into())).collect() }
	}
}

/// What `cryptsetup status` says about a mapper name.
///
/// Any field may be missing when a later step of the lookup failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapperStatus {
	pub active: bool,
	pub underlying: Option<String>,
	pub uuid: Option<String>,
}

/// Read-only inputs for one analysis run.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
	pub devices: DeviceInventory,
	pub encryption: EncryptionMap,
}

#[derive(Deserialize, Debug)]
struct LsblkReport {
	#[serde(default)]
	blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize, Debug)]
struct LsblkDevice {
	name: String,
	#[serde(default)]
	uuid: Option<String>,
	#[serde(default)]
	fstype: Option<String>,
	#[serde(default)]
	mountpoint: Option<String>,
	#[serde(default)]
	size: Option<LsblkSize>,
	#[serde(default, rename = "type")]
	kind: Option<String>,
	#[serde(default)]
	children: Vec<LsblkDevice>,
}

/// Older util-linux prints sizes as strings even with `-b`.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum LsblkSize {
	Bytes(u64),
	Text(String),
}

impl LsblkSize {
	fn bytes(&self) -> Option<ByteSize> {
		match self {
			Self::Bytes(b) => Some(ByteSize::b(*b)),
			Self::Text(s) => s.trim().parse().ok().map(ByteSize::b),
		}
	}
}

impl From<LsblkDevice> for DeviceRecord {
	fn from(dev: LsblkDevice) -> Self {
		let path =
			if dev.name.starts_with('/') { dev.name } else { format!("/dev/{}", dev.name) };
		Self {
			path,
			uuid: dev.uuid,
			fstype: dev.fstype,
			mountpoint: dev.mountpoint,
			size: dev.size.as_ref().and_then(LsblkSize::bytes),
			class: dev.kind.as_deref().map_or(DeviceClass::Other(String::new()), DeviceClass::from),
		}
	}
}

/// Parses `lsblk -J` output into a flat inventory.
///
/// Children are visited depth-first right after their parent, using an
/// explicit stack.
pub fn parse_lsblk(json: &str) -> Result<DeviceInventory, serde_json::Error> {
	let report: LsblkReport = serde_json::from_str(json)?;
	let mut inventory = DeviceInventory::default();
	let mut stack: Vec<LsblkDevice> = report.blockdevices.into_iter().rev().collect();
	while let Some(mut dev) = stack.pop() {
		stack.extend(std::mem::take(&mut dev.children).into_iter().rev());
		inventory.insert(dev.into());
	}
	Ok(inventory)
}

/// Parses `blkid -t TYPE=crypto_LUKS`. Lines not in the expected shape are ignored.
pub fn parse_blkid_luks(output: &str) -> EncryptionMap {
	output
		.lines()
		.filter_map(|line| BLKID_LUKS_LINE.captures(line.trim()))
		.map(|caps| (caps[2].to_owned(), caps[1].to_owned()))
		.inspect(|(uuid, device)| info!(device, uuid, "LUKS container found"))
		.collect()
}

/// Returns whether the mapping is active, and its backing device if listed.
pub fn parse_cryptsetup_status(output: &str) -> (bool, Option<String>) {
	if !output.contains("is active") {
		return (false, None);
	}
	let device = CRYPTSETUP_DEVICE.captures(output).map(|caps| caps[1].to_owned());
	(true, device)
}

/// Parses `btrfs subvolume list`, one `... path <name>` per line.
pub fn parse_subvolume_list(output: &str) -> Vec<String> {
	output
		.lines()
		.filter_map(|line| SUBVOLUME_PATH.captures(line.trim()))
		.map(|caps| caps[1].to_owned())
		.collect()
}

/// Queries the live system through a [`Host`].
pub struct Inventory<'h, H: Host + ?Sized> {
	host: &'h H,
}

impl<'h, H: Host + ?Sized> Inventory<'h, H> {
	pub const fn new(host: &'h H) -> Self {
		Self { host }
	}

	/// Devices and LUKS containers, taken once at the start of a run.
	#[instrument(skip(self))]
	pub fn snapshot(&self) -> Snapshot {
		let snapshot =
			Snapshot { devices: self.query_devices(), encryption: self.query_encryption_map() };
		debug!(
			devices = snapshot.devices.len(),
			containers = snapshot.encryption.len(),
			"Inventory snapshot taken"
		);
		if snapshot.devices.is_empty() {
			warn!("Device inventory is empty, UUID references stay unresolved");
		}
		if snapshot.encryption.is_empty() {
			debug!("No LUKS containers known");
		}
		snapshot
	}

	pub fn try_query_devices(&self) -> Result<DeviceInventory, QueryFailed> {
		let out = self.host.run("lsblk", LSBLK_ARGS)?;
		parse_lsblk(&out).map_err(|e| QueryFailed::Parse {
			command: crate::host::command_line("lsblk", LSBLK_ARGS),
			reason: e.to_string(),
		})
	}

	pub fn query_devices(&self) -> DeviceInventory {
		self.try_query_devices().unwrap_or_else(|err| {
			warn!(%err, "Cannot list block devices");
			DeviceInventory::default()
		})
	}

	pub fn try_query_encryption_map(&self) -> Result<EncryptionMap, QueryFailed> {
		match self.host.run("blkid", &["-t", &format!("TYPE={LUKS_TYPE}")]) {
			Ok(out) => Ok(parse_blkid_luks(&out)),
			Err(QueryFailed::Status { code: BLKID_NO_MATCH, .. }) => {
				debug!("No LUKS containers on this system");
				Ok(EncryptionMap::default())
			},
			Err(err) => Err(err),
		}
	}

	pub fn query_encryption_map(&self) -> EncryptionMap {
		self.try_query_encryption_map().unwrap_or_else(|err| {
			warn!(%err, "Cannot list LUKS containers");
			EncryptionMap::default()
		})
	}

	/// Looks up an unlocked mapping by name. Never fails: an unknown or
	/// inactive mapping is simply not active, and a backing device whose UUID
	/// cannot be read still reports the device.
	#[instrument(skip(self))]
	pub fn query_mapper_status(&self, name: &str) -> MapperStatus {
		let out = match self.host.run("cryptsetup", &["status", name]) {
			Ok(out) => out,
			Err(err) => {
				debug!(%err, "Mapping is not an active LUKS mapping");
				return MapperStatus::default();
			},
		};

		let (active, underlying) = parse_cryptsetup_status(&out);
		if !active {
			return MapperStatus::default();
		}
		let Some(underlying) = underlying else {
			warn!(name, "Active mapping without a backing device in cryptsetup output");
			return MapperStatus { active, ..MapperStatus::default() };
		};

		let uuid = match self.host.run("blkid", &["-o", "value", "-s", "UUID", &underlying]) {
			Ok(uuid) if !uuid.is_empty() => Some(uuid),
			Ok(_) => None,
			Err(err) => {
				warn!(%err, device = underlying, "Cannot read UUID of LUKS container");
				None
			},
		};
		trace!(name, underlying, ?uuid, "Mapping resolved");
		MapperStatus { active, underlying: Some(underlying), uuid }
	}

	/// Lists btrfs subvolumes by mounting `device` read-only in a scratch
	/// directory. The mount and the directory are always cleaned up.
	pub fn try_query_subvolumes(&self, device: &str) -> Result<Vec<String>, QueryFailed> {
		let scratch = ScratchMount::new(self.host, device)?;
		let target = scratch.path().to_string_lossy().into_owned();
		let out = self.host.run("btrfs", &["subvolume", "list", &target])?;
		let subvolumes = parse_subvolume_list(&out);
		for subvol in &subvolumes {
			debug!(device, subvol, "btrfs subvolume found");
		}
		Ok(subvolumes)
	}

	#[instrument(skip(self))]
	pub fn query_subvolumes(&self, device: &str) -> Vec<String> {
		self.try_query_subvolumes(device).unwrap_or_else(|err| {
			warn!(%err, "Cannot list btrfs subvolumes");
			Vec::new()
		})
	}
}

/// A read-only mount in a fresh temporary directory.
///
/// Dropping it unmounts (if the mount succeeded) and then removes the directory.
struct ScratchMount<'h, H: Host + ?Sized> {
	host: &'h H,
	dir: Option<TempDir>,
	mounted: bool,
}

impl<'h, H: Host + ?Sized> ScratchMount<'h, H> {
	fn new(host: &'h H, device: &str) -> Result<Self, QueryFailed> {
		let dir = tempfile::Builder::new()
			.prefix(SCRATCH_PREFIX)
			.tempdir()
			.map_err(QueryFailed::Scratch)?;
		let mut scratch = Self { host, dir: Some(dir), mounted: false };
		host.mount(device, scratch.path(), "btrfs")?;
		scratch.mounted = true;
		Ok(scratch)
	}

	fn path(&self) -> &Path {
		self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
	}
}

impl<H: Host + ?Sized> Drop for ScratchMount<'_, H> {
	fn drop(&mut self) {
		if self.mounted {
			if let Err(err) = self.host.unmount(self.path()) {
				warn!(%err, "Cannot unmount scratch mount");
			}
		}
		if let Some(dir) = self.dir.take() {
			let path = dir.path().to_path_buf();
			if let Err(err) = dir.close() {
				warn!(%err, ?path, "Cannot remove scratch directory");
			}
		}
	}
}
