use std::path::PathBuf;

use thiserror::Error;

/// Fatal analysis errors. Anything here aborts the run.
#[derive(Debug, Error)]
pub enum Error {
	#[error("mount table not found: {}", .0.display())]
	MountTableNotFound(PathBuf),

	#[error("cannot read mount table {}", path.display())]
	ReadMountTable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("cannot load config {}", path.display())]
	Config {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("cannot render template `{0}`")]
	Template(&'static str, #[source] tera::Error),

	#[error("cannot serialize mount plan")]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Failure of a single external query.
///
/// The inventory never escalates this; it degrades to an empty or partial
/// result and logs the command that was attempted.
#[derive(Debug, Error)]
pub enum QueryFailed {
	#[error("cannot spawn `{command}`")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("`{command}` returned code {code}: {stderr}")]
	Status { command: String, code: i32, stderr: String },

	#[error("cannot parse output of `{command}`: {reason}")]
	Parse { command: String, reason: String },

	#[error("cannot mount {device} on {}", target.display())]
	Mount {
		device: String,
		target: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("cannot unmount {}", target.display())]
	Unmount {
		target: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("cannot create scratch directory")]
	Scratch(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
