//! Persistence: category files, online dumps and the file helpers they share.
//!
//! ## Save strategy
//!
//! 1. Write to a temporary file in the same directory
//! 2. Call `sync_all()` on the temporary file
//! 3. Atomically rename it over the destination
//! 4. Fsync the parent directory (Unix only)
//!
//! The temporary file is removed on every failure path, so the destination
//! holds either the old or the new content.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::error::{MaxcatError, Result};

/// Category file layout, header codec and save/load paths.
pub mod category_file;

/// Versioned text header of category files.
pub mod header;

/// Plain-text listing of a fitted model.
pub mod inspect;

/// Resumable snapshot of a learner.
pub mod online_dump;

fn parent_dir(path: &Path) -> &Path {
	match path.parent() {
		Some(parent) if !parent.as_os_str().is_empty() => parent,
		_ => Path::new("."),
	}
}

/// Fsync the parent directory so the rename is durable.
#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
	File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
	Ok(())
}

/// Atomically replaces `path` with whatever `write` produces.
///
/// # Errors
/// `SaveFailed` wrapping the first I/O error. The destination is untouched
/// and the temporary file is gone.
pub(crate) fn atomic_write<F>(path: &Path, write: F) -> Result<()>
where
	F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
	let failed = |source: io::Error| MaxcatError::SaveFailed { path: path.to_path_buf(), source };
	let dir = parent_dir(path);
	let mut temp = tempfile::Builder::new().prefix(".maxcat-").suffix(".tmp").tempfile_in(dir).map_err(failed)?;
	{
		let mut writer = BufWriter::new(temp.as_file_mut());
		write(&mut writer).map_err(failed)?;
		writer.flush().map_err(failed)?;
	}
	temp.as_file().sync_all().map_err(failed)?;
	temp.persist(path).map_err(|e| failed(e.error))?;
	fsync_dir(dir).map_err(failed)?;
	Ok(())
}

/// Fails with `ForeignFile` if `path` exists and does not start with `magic`.
///
/// Existing files of another kind are never overwritten.
pub(crate) fn ensure_replaceable(path: &Path, magic: &str) -> Result<()> {
	let mut file = match File::open(path) {
		Ok(file) => file,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
		Err(e) => return Err(e.into()),
	};
	let mut head = vec![0u8; magic.len()];
	let mut read = 0;
	while read < head.len() {
		match file.read(&mut head[read..])? {
			0 => break,
			n => read += n,
		}
	}
	if read == 0 || head[..read] == magic.as_bytes()[..read] && read == head.len() {
		Ok(())
	} else {
		Err(MaxcatError::ForeignFile { path: path.to_path_buf() })
	}
}

/// Access hints for a region read front to back.
pub(crate) fn map_hints_mut(map: &MmapMut, lock: bool) {
	#[cfg(unix)]
	{
		let _ = map.advise(memmap2::Advice::Sequential);
		if lock {
			let _ = map.lock();
		}
	}
	#[cfg(not(unix))]
	let _ = (map, lock);
}

/// Access hints for a region probed at random.
pub(crate) fn map_hints(map: &Mmap, lock: bool) {
	#[cfg(unix)]
	{
		let _ = map.advise(memmap2::Advice::Random);
		if lock {
			let _ = map.lock();
		}
	}
	#[cfg(not(unix))]
	let _ = (map, lock);
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	#[test]
	fn atomic_write_replaces_content() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model");
		fs::write(&path, b"old").unwrap();
		atomic_write(&path, |w| w.write_all(b"new")).unwrap();
		assert_eq!(fs::read(&path).unwrap(), b"new");
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
	}

	#[test]
	fn failed_write_leaves_destination() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model");
		fs::write(&path, b"old").unwrap();
		let result = atomic_write(&path, |w| {
			w.write_all(b"partial")?;
			Err(io::Error::other("disk full"))
		});
		assert!(matches!(result, Err(MaxcatError::SaveFailed { .. })));
		assert_eq!(fs::read(&path).unwrap(), b"old");
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
	}

	#[test]
	fn foreign_files_are_protected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("notes.txt");
		assert!(ensure_replaceable(&path, "#maxcat").is_ok());
		fs::write(&path, b"shopping list").unwrap();
		assert!(matches!(ensure_replaceable(&path, "#maxcat"), Err(MaxcatError::ForeignFile { .. })));
		fs::write(&path, b"#maxcat category v1 x\n").unwrap();
		assert!(ensure_replaceable(&path, "#maxcat").is_ok());
		fs::write(&path, b"").unwrap();
		assert!(ensure_replaceable(&path, "#maxcat").is_ok());
	}
}
