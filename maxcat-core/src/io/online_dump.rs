//! Resumable snapshot of a learner.
//!
//! Layout:
//! 1. `#maxcat online v1\n`
//! 2. u64 length, then the postcard-encoded [`LearnerImage`]
//! 3. one fixed-size record per feature table slot
//! 4. u64 length, then the raw token spool
//!
//! All integers are little-endian. The fitted weights travel along, but the
//! smoothed reference does not: a resumed learner must be optimized again.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{atomic_write, ensure_replaceable};
use crate::config::{ModelOptions, StoreConfig};
use crate::error::{MaxcatError, Result, Warnings};
use crate::model::digram::DigramTable;
use crate::model::document::{DocumentStats, EntropySummary};
use crate::model::feature_store::{Feature, FeatureStore, Slot};
use crate::model::learner::{FitSummary, Learner, ModelStats, RegexSpec};
use crate::model::token_spool::TokenSpool;
use crate::session::Session;
use crate::token::TokenClass;

/// Leading bytes shared by every version of the online dump format.
pub const ONLINE_MAGIC: &str = "#maxcat online v";
/// Format version written by this library.
pub const ONLINE_VERSION: &str = "1";

/// Bytes of one slot record: tag, id, count, order, class, lambda, document weight.
pub const SLOT_RECORD: usize = 1 + 8 + 4 + 1 + 1 + 8 + 8;

const TAG_EMPTY: u8 = 0;
const TAG_FILLED: u8 = 1;

/// Everything about a learner except its feature slots and spool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LearnerImage {
	name: String,
	options: ModelOptions,
	regexes: Vec<RegexSpec>,
	store: StoreConfig,
	hash_bits: u8,
	stats: ModelStats,
	fit: FitSummary,
	entropy: EntropySummary,
	docs: DocumentStats,
	digram_counts: Vec<f64>,
	warnings: u16,
}

fn slot_record(slot: &Slot) -> [u8; SLOT_RECORD] {
	let mut record = [0u8; SLOT_RECORD];
	if let Some(f) = slot.feature() {
		record[0] = TAG_FILLED;
		record[1..9].copy_from_slice(&f.id.to_le_bytes());
		record[9..13].copy_from_slice(&f.count.to_le_bytes());
		record[13] = f.order;
		record[14] = f.class.index() as u8;
		record[15..23].copy_from_slice(&f.lambda.to_le_bytes());
		record[23..31].copy_from_slice(&f.doc_weight.to_le_bytes());
	}
	record
}

fn parse_slot(record: &[u8]) -> Option<Slot> {
	let u64_at = |at: usize| record[at..at + 8].try_into().ok().map(u64::from_le_bytes);
	match record[0] {
		TAG_EMPTY => Some(Slot::Empty),
		TAG_FILLED => {
			let id = u64_at(1).filter(|&id| id != 0)?;
			let class = TokenClass::from_index(record[14] as usize)?;
			let mut feature = Feature::new(id, record[13], class);
			feature.count = u32::from_le_bytes(record[9..13].try_into().ok()?);
			feature.lambda = f64::from_bits(u64_at(15)?);
			feature.doc_weight = f64::from_bits(u64_at(23)?);
			Some(Slot::Filled(feature))
		}
		_ => None,
	}
}

/// Sequential reader over the dump bytes.
struct DumpReader<'a> {
	bytes: &'a [u8],
	pos: usize,
	path: &'a Path,
}

impl<'a> DumpReader<'a> {
	fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
		let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
		let end = end.ok_or_else(|| MaxcatError::corrupt(self.path, format!("truncated {}", what)))?;
		let bytes = self.bytes;
		let taken = &bytes[self.pos..end];
		self.pos = end;
		Ok(taken)
	}

	fn length(&mut self, what: &str) -> Result<usize> {
		let raw = self.take(8, what)?;
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(raw);
		usize::try_from(u64::from_le_bytes(bytes)).map_err(|_| MaxcatError::corrupt(self.path, format!("oversized {}", what)))
	}
}

impl Learner {
	/// Saves a resumable snapshot of this learner, atomically.
	///
	/// # Errors
	/// - `ForeignFile` if the destination exists and is not an online dump
	/// - `SaveFailed` if the write failed; the destination is intact
	pub fn write_online_dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
		let path = path.as_ref();
		ensure_replaceable(path, ONLINE_MAGIC)?;
		let image = LearnerImage {
			name: self.name().to_owned(),
			options: self.options.clone(),
			regexes: self.regexes.clone(),
			store: self.store.config(),
			hash_bits: self.store.hash_bits(),
			stats: self.stats.clone(),
			fit: self.fit,
			entropy: self.entropy,
			docs: self.docs,
			digram_counts: self.counts.cells().to_vec(),
			warnings: self.warnings().bits(),
		};
		let encoded = postcard::to_allocvec(&image)?;
		atomic_write(path, |out| {
			writeln!(out, "{}{}", ONLINE_MAGIC, ONLINE_VERSION)?;
			out.write_all(&(encoded.len() as u64).to_le_bytes())?;
			out.write_all(&encoded)?;
			for slot in self.store.slots() {
				out.write_all(&slot_record(slot))?;
			}
			out.write_all(&self.spool.len().to_le_bytes())?;
			self.spool.write_to(out).map_err(std::io::Error::other)
		})?;
		info!(model = %self.name(), path = %path.display(), features = self.store.unique_count(), "wrote online dump");
		Ok(())
	}

	/// Rebuilds a learner from an online dump.
	///
	/// The stored model options win over the session's; a warning is logged
	/// when they differ. The session still decides where and how the spool
	/// lives.
	///
	/// # Errors
	/// - `Io` if the file cannot be read
	/// - `ForeignFile` / `VersionMismatch` for files of another kind or version
	/// - `Corrupt` if the sizes are inconsistent
	pub fn resume<P: AsRef<Path>>(session: &Session, path: P) -> Result<Learner> {
		let path = path.as_ref();
		let bytes = fs::read(path)?;
		let Some(versioned) = bytes.strip_prefix(ONLINE_MAGIC.as_bytes()) else {
			return Err(MaxcatError::ForeignFile { path: path.to_path_buf() });
		};
		let line_end = versioned.iter().position(|&b| b == b'\n').unwrap_or(versioned.len());
		let version = String::from_utf8_lossy(&versioned[..line_end]);
		if version != ONLINE_VERSION {
			return Err(MaxcatError::VersionMismatch { path: path.to_path_buf(), found: version.into_owned() });
		}

		let mut reader = DumpReader { bytes: &bytes, pos: 0, path };
		reader.pos = ONLINE_MAGIC.len() + line_end + 1;
		let image_len = reader.length("image length")?;
		let image: LearnerImage = postcard::from_bytes(reader.take(image_len, "image")?)?;
		if image.hash_bits == 0 || image.hash_bits > 40 {
			return Err(MaxcatError::corrupt(path, format!("hash size of {} bits", image.hash_bits)));
		}

		let slot_count = 1usize << image.hash_bits;
		let records = reader.take(slot_count * SLOT_RECORD, "feature table")?;
		let slots = records
			.chunks_exact(SLOT_RECORD)
			.map(parse_slot)
			.collect::<Option<Vec<Slot>>>()
			.ok_or_else(|| MaxcatError::corrupt(path, "bad feature record"))?;
		let store = FeatureStore::from_slots(slots, image.store).ok_or_else(|| MaxcatError::corrupt(path, "bad table size"))?;
		if store.unique_count() as u64 != image.stats.unique_counts.iter().sum::<u64>() {
			return Err(MaxcatError::corrupt(path, "feature count disagrees with statistics"));
		}

		let spool_len = reader.length("spool length")?;
		let spool_bytes = reader.take(spool_len, "spool")?;
		if reader.pos != bytes.len() {
			return Err(MaxcatError::corrupt(path, "trailing bytes"));
		}
		let config = &session.config;
		let spool = TokenSpool::from_bytes(config.spool_dir.as_deref(), config.mmap_spool, config.save.lock_memory, spool_bytes)?;
		let counts = DigramTable::from_cells(image.digram_counts).ok_or_else(|| MaxcatError::corrupt(path, "bad digram table"))?;

		if image.options != config.model {
			warn!(model = %image.name, "online dump options differ from the session, keeping the dump's");
		}
		let mut learner = Learner::from_parts(session, &image.name, image.options, store, spool);
		learner.regexes = image.regexes;
		learner.counts = counts;
		learner.stats = image.stats;
		learner.fit = image.fit;
		learner.fit.fitted = false;
		learner.entropy = image.entropy;
		learner.docs = image.docs;
		learner.warnings = Warnings::from_bits(image.warnings);
		info!(model = %learner.name(), path = %path.display(), features = learner.unique_token_count(), "resumed learner");
		Ok(learner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Smoothing;
	use crate::token::Token;

	fn learner(session: &Session) -> Learner {
		let mut learner = Learner::new(session, "news").unwrap();
		for doc in ["stocks fell today", "stocks rose"] {
			for w in doc.split_whitespace() {
				learner.learn(&Token::unigram(w.as_bytes(), TokenClass::Header).unwrap()).unwrap();
			}
			learner.end_document();
		}
		learner
	}

	#[test]
	fn resume_restores_counts_and_spool() {
		let session = Session::default();
		let original = learner(&session);
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("news.online");
		original.write_online_dump(&path).unwrap();

		let resumed = Learner::resume(&session, &path).unwrap();
		assert_eq!(resumed.name(), "news");
		assert_eq!(resumed.stats(), original.stats());
		assert_eq!(resumed.digram_counts(), original.digram_counts());
		assert_eq!(resumed.document_stats(), original.document_stats());
		let counts = |l: &Learner| l.store().iter().map(|f| (f.id, f.count, f.class)).collect::<Vec<_>>();
		assert_eq!(counts(&resumed), counts(&original));
		assert_eq!(resumed.spool().len(), original.spool().len());
	}

	#[test]
	fn dump_options_win() {
		let mut session = Session::default();
		session.config.model.smoothing = Smoothing::Mle;
		let original = learner(&session);
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("news.online");
		original.write_online_dump(&path).unwrap();

		let other = Session::default();
		let resumed = Learner::resume(&other, &path).unwrap();
		assert_eq!(resumed.options().smoothing, Smoothing::Mle);
	}

	#[test]
	fn wrong_files_are_rejected() {
		let session = Session::default();
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dump");

		fs::write(&path, b"#maxcat category v1 x\n").unwrap();
		assert!(matches!(Learner::resume(&session, &path), Err(MaxcatError::ForeignFile { .. })));
		assert!(matches!(learner(&session).write_online_dump(&path), Err(MaxcatError::ForeignFile { .. })));

		fs::write(&path, b"#maxcat online v9\n").unwrap();
		assert!(matches!(Learner::resume(&session, &path), Err(MaxcatError::VersionMismatch { .. })));

		learner(&session).write_online_dump(&path).unwrap();
		let mut bytes = fs::read(&path).unwrap();
		bytes.truncate(bytes.len() - 2);
		fs::write(&path, &bytes).unwrap();
		let err = Learner::resume(&session, &path).err().unwrap();
		assert!(matches!(err, MaxcatError::Corrupt { .. }));
	}
}
