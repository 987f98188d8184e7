use std::{io::Write, os::unix::fs::PermissionsExt, path::Path};

use tracing::trace;

/// Renders a template from `templates/`, inserting each named variable into
/// the context under its own name.
#[macro_export]
macro_rules! tpl {
	($f:literal => { $($v:ident),* $(,)? }) => {{
		let mut ctx = tera::Context::new();
		$(ctx.insert(stringify!($v), &$v);)*
		tera::Tera::one_off(include_str!($f), &ctx, false)
			.map_err(|e| $crate::error::Error::Template($f, e))
	}};
}

/// Declares a header comment for generated files.
#[macro_export]
macro_rules! prepend_comment {
	($var:ident: $path:literal, $desc:literal, $generator:path) => {
		pub const $var: &str = const_format::formatcp!(
			"# {}: {}\n#\n# Generated by {} v{} ({}).\n# Regenerate it instead of editing by hand.",
			$path,
			$desc,
			env!("CARGO_PKG_NAME"),
			env!("CARGO_PKG_VERSION"),
			stringify!($generator),
		);
	};
}

/// Quotes `value` for POSIX sh. Words made only of safe characters are left bare.
pub fn shell_quote(value: &str) -> String {
	const SAFE: &[u8] = b"/-_.,:=@+%";
	if !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric() || SAFE.contains(&b)) {
		value.to_owned()
	} else {
		format!("'{}'", value.replace('\'', r"'\''"))
	}
}

/// Writes `content` to `path`, creating parent directories.
pub fn just_write(path: &Path, content: &str) -> std::io::Result<()> {
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)?;
	}
	trace!(?path, bytes = content.len(), "Writing file");
	let mut f = std::fs::File::create(path)?;
	f.write_all(content.as_bytes())?;
	Ok(())
}

/// Like [`just_write`], then marks the file executable.
pub fn write_executable(path: &Path, content: &str) -> std::io::Result<()> {
	just_write(path, content)?;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}
