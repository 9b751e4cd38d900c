//! Binary layout of category files and the three ways of writing them.
//!
//! After the text header come two fixed-size sections:
//! - the smoothed digram table, `256 * 256` weights
//! - the feature table, `2^hash_bits` records of `id (u64) + weight`
//!
//! Record `i` of the feature table is slot `i` of the learner's table, so a
//! reader probes the file exactly like the learner probed memory. Empty
//! slots are written with id zero.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use memmap2::MmapMut;
use tracing::{debug, info};

use super::header::{CATEGORY_MAGIC, CategoryHeader};
use super::{atomic_write, ensure_replaceable, fsync_dir, map_hints_mut, parent_dir};
use crate::config::SaveOptions;
use crate::error::{MaxcatError, Result};
use crate::model::digram::{ASIZE, DigramTable};
use crate::model::feature_store::{FeatureStore, Slot};
use crate::model::learner::Learner;
use crate::weight::{ByteOrder, WeightCodec, WeightEncoding};

/// Bytes of one feature record.
pub const FEATURE_RECORD: usize = 8 + WeightEncoding::WIDTH;

/// Outcome of [`Learner::fast_partial_save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialSave {
	Written,
	/// The file was left untouched, for the given reason.
	Unavailable(String),
}

pub fn digram_section_len() -> usize {
	ASIZE * ASIZE * WeightEncoding::WIDTH
}

pub fn feature_section_len(hash_bits: u8) -> usize {
	(1usize << hash_bits) * FEATURE_RECORD
}

/// Total length of a category file whose header takes `header_len` bytes.
pub fn file_len(header_len: usize, hash_bits: u8) -> usize {
	header_len + digram_section_len() + feature_section_len(hash_bits)
}

pub(crate) fn digram_records(table: &DigramTable, codec: WeightCodec) -> impl Iterator<Item = [u8; WeightEncoding::WIDTH]> + '_ {
	table.cells().iter().map(move |&cell| {
		let mut record = [0u8; WeightEncoding::WIDTH];
		codec.write(&mut record, cell);
		record
	})
}

pub(crate) fn feature_records(store: &FeatureStore, codec: WeightCodec) -> impl Iterator<Item = [u8; FEATURE_RECORD]> + '_ {
	store.slots().iter().map(move |slot| {
		let mut record = [0u8; FEATURE_RECORD];
		if let Slot::Filled(f) | Slot::Marked(f) = slot {
			codec.order.put_u64(&mut record, f.id);
			codec.write(&mut record[8..], f.lambda);
		}
		record
	})
}

pub(crate) fn decode_digrams(bytes: &[u8], codec: WeightCodec) -> Option<DigramTable> {
	let cells = bytes.chunks_exact(WeightEncoding::WIDTH).map(|c| codec.read(c)).collect();
	DigramTable::from_cells(cells)
}

/// Writes both sections to a stream.
fn write_sections(out: &mut dyn Write, reference: &DigramTable, store: &FeatureStore, codec: WeightCodec) -> io::Result<()> {
	for record in digram_records(reference, codec) {
		out.write_all(&record)?;
	}
	for record in feature_records(store, codec) {
		out.write_all(&record)?;
	}
	Ok(())
}

/// Writes both sections into a mapped region laid out as on disk.
fn fill_sections(data: &mut [u8], reference: &DigramTable, store: &FeatureStore, codec: WeightCodec) {
	let (digrams, features) = data.split_at_mut(digram_section_len());
	for (dst, record) in digrams.chunks_exact_mut(WeightEncoding::WIDTH).zip(digram_records(reference, codec)) {
		dst.copy_from_slice(&record);
	}
	for (dst, record) in features.chunks_exact_mut(FEATURE_RECORD).zip(feature_records(store, codec)) {
		dst.copy_from_slice(&record);
	}
}

impl Learner {
	/// The smoothed table of a fitted learner.
	pub(crate) fn fitted_reference(&self) -> Result<&DigramTable> {
		match self.reference.as_ref() {
			Some(reference) if self.fit.fitted => Ok(reference),
			_ => Err(MaxcatError::NotFitted(self.name().to_owned())),
		}
	}

	/// Encodes the category file in memory.
	pub(crate) fn category_bytes(&self, byte_order: ByteOrder) -> Result<Vec<u8>> {
		let reference = self.fitted_reference()?;
		let header = CategoryHeader::from_learner(self, byte_order).render();
		let codec = WeightCodec::new(self.options.encoding, byte_order);
		let mut bytes = Vec::with_capacity(file_len(header.len(), self.store.hash_bits()));
		bytes.extend_from_slice(header.as_bytes());
		write_sections(&mut bytes, reference, &self.store, codec)?;
		Ok(bytes)
	}

	/// Saves the fitted model as a category file.
	///
	/// # Behavior
	/// - The file is always built as a temporary sibling and renamed over the
	///   destination, so readers that mapped the old file keep a valid view.
	/// - With `save.mmap` and an existing destination the sibling is filled
	///   through a memory map; if that fails the buffered path is used.
	///
	/// # Errors
	/// - `NotFitted` if the learner was never optimized
	/// - `ForeignFile` if the destination exists and is not a category file
	/// - `SaveFailed` if the atomic write failed; the destination is intact
	pub fn save_category<P: AsRef<Path>>(&self, path: P, save: &SaveOptions) -> Result<()> {
		let path = path.as_ref();
		let reference = self.fitted_reference()?;
		ensure_replaceable(path, CATEGORY_MAGIC)?;
		let byte_order = ByteOrder::for_save(save.portable);
		let header = CategoryHeader::from_learner(self, byte_order).render();
		let codec = WeightCodec::new(self.options.encoding, byte_order);

		if save.mmap && path.exists() {
			match self.save_mapped(path, &header, reference, codec, save.lock_memory) {
				Ok(()) => {
					info!(model = %self.name(), path = %path.display(), "saved category through memory map");
					return Ok(());
				}
				Err(e) => {
					debug!(model = %self.name(), "mapped save failed, using atomic save: {}", e);
				}
			}
		}

		atomic_write(path, |out| {
			out.write_all(header.as_bytes())?;
			write_sections(out, reference, &self.store, codec)
		})?;
		info!(model = %self.name(), path = %path.display(), features = self.store.unique_count(), "saved category");
		Ok(())
	}

	/// Fills a mapped temporary sibling and renames it over `path`.
	fn save_mapped(&self, path: &Path, header: &str, reference: &DigramTable, codec: WeightCodec, lock: bool) -> io::Result<()> {
		let dir = parent_dir(path);
		let temp = tempfile::Builder::new().prefix(".maxcat-").suffix(".tmp").tempfile_in(dir)?;
		temp.as_file().set_len(file_len(header.len(), self.store.hash_bits()) as u64)?;
		{
			// SAFETY: the temporary file is private to this save until it is
			// renamed, so nothing else maps or resizes it
			let mut map = unsafe { MmapMut::map_mut(temp.as_file())? };
			map_hints_mut(&map, lock);
			map[..header.len()].copy_from_slice(header.as_bytes());
			fill_sections(&mut map[header.len()..], reference, &self.store, codec);
			map.flush()?;
		}
		temp.as_file().sync_all()?;
		temp.persist(path).map_err(|e| e.error)?;
		fsync_dir(dir)
	}

	/// Rewrites an existing category file in place.
	///
	/// # Behavior
	/// Only the numeric header lines and the two arrays are overwritten, and
	/// only when the options, order, hash size, byte order and regexes are
	/// unchanged and the new numeric lines are exactly as long as the old.
	///
	/// # Returns
	/// `Unavailable` with the reason when any check fails; the file is then
	/// untouched.
	///
	/// # Notes
	/// Readers that map the file concurrently may observe a mix of old and
	/// new weights.
	pub fn fast_partial_save<P: AsRef<Path>>(&self, path: P, save: &SaveOptions) -> Result<PartialSave> {
		let path = path.as_ref();
		let reference = self.fitted_reference()?;
		let file = match OpenOptions::new().read(true).write(true).open(path) {
			Ok(file) => file,
			Err(e) => return Ok(PartialSave::Unavailable(format!("cannot open for update: {}", e))),
		};
		// SAFETY: the file is only read through the map until every check
		// has passed
		let mut map = match unsafe { MmapMut::map_mut(&file) } {
			Ok(map) => map,
			Err(e) => return Ok(PartialSave::Unavailable(format!("cannot map: {}", e))),
		};
		let parsed = match CategoryHeader::parse(&map, path) {
			Ok(parsed) => parsed,
			Err(e) => return Ok(PartialSave::Unavailable(e.to_string())),
		};
		let old = &parsed.header;
		let new = CategoryHeader::from_learner(self, ByteOrder::for_save(save.portable));

		let mismatch = if old.options != new.options || old.skewed != new.skewed {
			Some("options differ")
		} else if old.max_order != new.max_order {
			Some("model order differs")
		} else if old.hash_bits != new.hash_bits {
			Some("hash size differs")
		} else if old.byte_order != new.byte_order {
			Some("byte order differs")
		} else if old.regexes != new.regexes || old.name != new.name {
			Some("regexes or name differ")
		} else if map.len() != file_len(parsed.data_offset, old.hash_bits) {
			Some("file length does not match its header")
		} else {
			None
		};
		if let Some(reason) = mismatch {
			return Ok(PartialSave::Unavailable(reason.to_owned()));
		}
		let numeric = new.numeric_lines();
		if numeric.len() != parsed.numeric.len() {
			return Ok(PartialSave::Unavailable("header length changed".to_owned()));
		}

		map[parsed.numeric.clone()].copy_from_slice(numeric.as_bytes());
		let codec = WeightCodec::new(self.options.encoding, new.byte_order);
		fill_sections(&mut map[parsed.data_offset..], reference, &self.store, codec);
		map.flush()?;
		Ok(PartialSave::Written)
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;
	use crate::model::category::Category;
	use crate::session::Session;
	use crate::token::{Token, TokenClass};

	fn fitted(text: &str) -> (Session, Learner) {
		let mut session = Session::default();
		session.config.store.hash_bits = 8;
		let mut learner = Learner::new(&session, "ham").unwrap();
		for w in text.split_whitespace() {
			learner.learn(&Token::unigram(w.as_bytes(), TokenClass::Text).unwrap()).unwrap();
		}
		learner.end_document();
		let tolerances = session.config.tolerances;
		learner.optimize(&session, &tolerances).unwrap();
		(session, learner)
	}

	#[test]
	fn saved_file_has_expected_layout() {
		let (_session, learner) = fitted("meeting agenda notes meeting");
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ham.cat");
		learner.save_category(&path, &SaveOptions::default()).unwrap();
		let bytes = fs::read(&path).unwrap();
		let parsed = CategoryHeader::parse(&bytes, &path).unwrap();
		assert_eq!(bytes.len(), file_len(parsed.data_offset, 8));
		assert_eq!(parsed.header.unique_token_count, 3);
		assert_eq!(bytes, learner.category_bytes(ByteOrder::native()).unwrap());
	}

	#[test]
	fn unfitted_learner_is_not_saved() {
		let session = Session::default();
		let learner = Learner::new(&session, "empty").unwrap();
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("empty.cat");
		assert!(matches!(learner.save_category(&path, &SaveOptions::default()), Err(MaxcatError::NotFitted(_))));
		assert!(!path.exists());
	}

	#[test]
	fn mapped_save_matches_atomic_save() {
		let (_session, learner) = fitted("meeting agenda notes meeting");
		let dir = tempfile::tempdir().unwrap();
		let atomic = dir.path().join("a.cat");
		let mapped = dir.path().join("b.cat");
		learner.save_category(&atomic, &SaveOptions::default()).unwrap();
		learner.save_category(&mapped, &SaveOptions::default()).unwrap();
		learner.save_category(&mapped, &SaveOptions { mmap: true, ..SaveOptions::default() }).unwrap();
		assert_eq!(fs::read(&atomic).unwrap(), fs::read(&mapped).unwrap());
	}

	#[test]
	fn partial_save_refuses_other_byte_order() {
		let (_session, learner) = fitted("meeting agenda notes meeting");
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ham.cat");
		let foreign_order = SaveOptions { portable: ByteOrder::native() == ByteOrder::Little, ..SaveOptions::default() };
		learner.save_category(&path, &SaveOptions::default()).unwrap();
		let before = fs::read(&path).unwrap();
		let outcome = learner.fast_partial_save(&path, &foreign_order).unwrap();
		assert_eq!(outcome, PartialSave::Unavailable("byte order differs".to_owned()));
		assert_eq!(fs::read(&path).unwrap(), before);
	}

	#[test]
	fn mapped_save_leaves_open_readers_intact() {
		let (_session, old) = fitted("meeting agenda notes meeting");
		let (_session, new) = fitted("lunch moved lunch");
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ham.cat");
		old.save_category(&path, &SaveOptions::default()).unwrap();
		let reader = Category::open(&path, true).unwrap();
		let meeting = Token::unigram(b"meeting", TokenClass::Text).unwrap();
		let before = reader.contribution(&meeting);

		new.save_category(&path, &SaveOptions { mmap: true, ..SaveOptions::default() }).unwrap();
		assert_eq!(reader.contribution(&meeting), before);
		assert_eq!(reader.header().unique_token_count, 3);
		assert_eq!(Category::open(&path, true).unwrap().header().unique_token_count, 2);
		assert_eq!(fs::read(&path).unwrap(), new.category_bytes(ByteOrder::native()).unwrap());
	}
}
