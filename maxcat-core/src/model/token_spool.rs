use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{MaxcatError, Result};
use crate::io::map_hints_mut;
use crate::token::{TOKENSEP, Token};

/// Growth increment of a memory-mapped spool, in bytes.
pub const SPOOL_GROW: u64 = 1 << 16;

/// Append-only record of the text of every distinct token.
///
/// Records are `text CLASSEP class TOKENSEP`. The backing file is an
/// anonymous temporary file, so it disappears with the spool on every exit
/// path.
///
/// # Behavior
/// - When mapping is enabled the file is extended in [`SPOOL_GROW`] steps and
///   remapped; if a remap fails the spool carries on with plain file writes.
/// - Replay is sequential only.
#[derive(Debug)]
pub struct TokenSpool {
	file: File,
	map: Option<MmapMut>,
	used: u64,
	capacity: u64,
	lock_memory: bool,
}

impl TokenSpool {
	/// Creates an empty spool in `dir`, or the system temp dir.
	pub fn new(dir: Option<&Path>, mmap: bool, lock_memory: bool) -> Result<Self> {
		let file = match dir {
			Some(dir) => tempfile::tempfile_in(dir)?,
			None => tempfile::tempfile()?,
		};
		let mut spool = Self { file, map: None, used: 0, capacity: 0, lock_memory };
		if mmap {
			spool.remap(SPOOL_GROW);
		}
		Ok(spool)
	}

	/// Creates a spool holding `bytes`, as previously written by `write_to`.
	pub fn from_bytes(dir: Option<&Path>, mmap: bool, lock_memory: bool, bytes: &[u8]) -> Result<Self> {
		if bytes.last().is_some_and(|&b| b != TOKENSEP) {
			return Err(MaxcatError::corrupt(spool_path(), "unterminated record"));
		}
		let mut records = bytes.split(|&b| b == TOKENSEP);
		records.next_back();
		if let Some(bad) = records.position(|record| Token::from_record(record).is_none()) {
			return Err(MaxcatError::corrupt(spool_path(), format!("bad token record {}", bad)));
		}
		let mut spool = Self::new(dir, mmap, lock_memory)?;
		spool.append_bytes(bytes)?;
		Ok(spool)
	}

	/// Bytes of records stored so far.
	pub fn len(&self) -> u64 {
		self.used
	}

	pub fn is_empty(&self) -> bool {
		self.used == 0
	}

	pub fn is_mapped(&self) -> bool {
		self.map.is_some()
	}

	pub fn append(&mut self, token: &Token) -> Result<()> {
		let mut record = Vec::with_capacity(token.record_len());
		token.write_record(&mut record);
		self.append_bytes(&record)
	}

	fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
		let end = self.used + bytes.len() as u64;
		if self.map.is_some() && end > self.capacity {
			let wanted = self.capacity + SPOOL_GROW.max(bytes.len() as u64);
			self.remap(wanted);
		}
		match self.map.as_mut() {
			Some(map) => map[self.used as usize..end as usize].copy_from_slice(bytes),
			None => {
				self.file.seek(SeekFrom::Start(self.used))?;
				self.file.write_all(bytes)?;
			}
		}
		self.used = end;
		Ok(())
	}

	/// Extends the file to `capacity` bytes and maps it, falling back to
	/// unmapped I/O on failure.
	fn remap(&mut self, capacity: u64) {
		self.map = None;
		let mapped = self.file.set_len(capacity).and_then(|_| {
			// SAFETY: the file is an anonymous temporary owned by this spool
			unsafe { MmapMut::map_mut(&self.file) }
		});
		match mapped {
			Ok(map) => {
				map_hints_mut(&map, self.lock_memory);
				self.map = Some(map);
				self.capacity = capacity;
			}
			Err(e) => debug!("token spool mapping failed, using file I/O: {}", e),
		}
	}

	/// Replays every record in insertion order.
	///
	/// # Errors
	/// `Corrupt` if a record cannot be parsed, or whatever `visit` returns.
	pub fn for_each<F>(&self, mut visit: F) -> Result<()>
	where
		F: FnMut(Token) -> Result<()>,
	{
		let mut decode = |record: &[u8]| -> Result<()> {
			let token = Token::from_record(record).ok_or_else(|| MaxcatError::corrupt(spool_path(), "bad token record"))?;
			visit(token)
		};
		match &self.map {
			Some(map) => {
				for record in map[..self.used as usize].split(|&b| b == TOKENSEP).filter(|r| !r.is_empty()) {
					decode(record)?;
				}
			}
			None => {
				(&self.file).seek(SeekFrom::Start(0))?;
				let mut reader = BufReader::new((&self.file).take(self.used));
				let mut record = Vec::new();
				loop {
					record.clear();
					if reader.read_until(TOKENSEP, &mut record)? == 0 {
						break;
					}
					if record.last() == Some(&TOKENSEP) {
						record.pop();
					}
					decode(&record)?;
				}
			}
		}
		Ok(())
	}

	/// Copies the raw records to `out`.
	pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
		match &self.map {
			Some(map) => out.write_all(&map[..self.used as usize])?,
			None => {
				(&self.file).seek(SeekFrom::Start(0))?;
				std::io::copy(&mut (&self.file).take(self.used), out)?;
			}
		}
		Ok(())
	}
}

fn spool_path() -> PathBuf {
	PathBuf::from("<token spool>")
}
