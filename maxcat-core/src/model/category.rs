use std::fs::{self, File};
use std::io;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, info};

use super::digram::DigramTable;
use super::learner::Learner;
use crate::error::{MaxcatError, Result};
use crate::io::category_file::{FEATURE_RECORD, decode_digrams, digram_section_len, file_len};
use crate::io::header::CategoryHeader;
use crate::io::map_hints;
use crate::token::{Token, TokenClass};
use crate::weight::{ByteOrder, WeightCodec};

/// Bytes a category was loaded into.
enum Backing {
	Owned(Vec<u8>),
	Mapped(Mmap),
}

impl Deref for Backing {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		match self {
			Backing::Owned(bytes) => bytes,
			Backing::Mapped(map) => map,
		}
	}
}

/// Read-only feature table of a saved category.
///
/// Records are decoded on access, straight from the loaded bytes.
pub struct FeatureTable {
	backing: Backing,
	offset: usize,
	mask: usize,
	codec: WeightCodec,
}

impl FeatureTable {
	pub fn capacity(&self) -> usize {
		self.mask + 1
	}

	pub fn is_mapped(&self) -> bool {
		matches!(self.backing, Backing::Mapped(_))
	}

	fn record(&self, index: usize) -> &[u8] {
		let start = self.offset + index * FEATURE_RECORD;
		&self.backing[start..start + FEATURE_RECORD]
	}

	/// Weight of `id`, probing the way the learner's table did.
	pub fn lookup(&self, id: u64) -> Option<f64> {
		if id == 0 {
			return None;
		}
		let start = (id as usize) & self.mask;
		let mut i = start;
		loop {
			let record = self.record(i);
			match self.codec.order.get_u64(record) {
				0 => return None,
				stored if stored == id => return Some(self.codec.read(&record[8..])),
				_ => {}
			}
			i = (i + 1) & self.mask;
			if i == start {
				return None;
			}
		}
	}
}

/// What one token adds to a category's score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
	pub value: f64,
	/// Whether the token is a feature of the category.
	pub known: bool,
}

/// A fitted category, as used for classification.
///
/// # Responsibilities
/// - Validating and holding a loaded category file
/// - Per-token score contributions
/// - Exposing the statistics stored in the header
pub struct Category {
	header: CategoryHeader,
	digrams: DigramTable,
	features: FeatureTable,
}

impl Category {
	/// Loads a category file.
	///
	/// With `mmap` the feature table stays in a read-only mapping of the file;
	/// if mapping fails the file is read into memory instead.
	///
	/// # Errors
	/// - `Io` if the file cannot be read
	/// - `ForeignFile` / `VersionMismatch` for files of another kind or version
	/// - `Corrupt` if the sizes disagree with the header
	pub fn open<P: AsRef<Path>>(path: P, mmap: bool) -> Result<Self> {
		let path = path.as_ref();
		let backing = if mmap {
			match map_file(path) {
				Ok(map) => Backing::Mapped(map),
				Err(e) => {
					debug!(path = %path.display(), "mapping failed, reading category: {}", e);
					Backing::Owned(fs::read(path)?)
				}
			}
		} else {
			Backing::Owned(fs::read(path)?)
		};
		let category = Self::from_backing(backing, path)?;
		info!(
			category = %category.name(),
			path = %path.display(),
			mapped = category.features.is_mapped(),
			"loaded category"
		);
		Ok(category)
	}

	/// The category `learner` would save, without touching the disk.
	///
	/// # Errors
	/// `NotFitted` if the learner was never optimized.
	pub fn from_learner(learner: &Learner) -> Result<Self> {
		let bytes = learner.category_bytes(ByteOrder::native())?;
		Self::from_backing(Backing::Owned(bytes), Path::new(learner.name()))
	}

	fn from_backing(backing: Backing, path: &Path) -> Result<Self> {
		let parsed = CategoryHeader::parse(&backing, path)?;
		let header = parsed.header;
		let expected = file_len(parsed.data_offset, header.hash_bits);
		if backing.len() != expected {
			return Err(MaxcatError::corrupt(
				path,
				format!("{} bytes, header describes {}", backing.len(), expected),
			));
		}
		let codec = WeightCodec::new(header.options.encoding, header.byte_order);
		let digram_end = parsed.data_offset + digram_section_len();
		let digrams = decode_digrams(&backing[parsed.data_offset..digram_end], codec)
			.ok_or_else(|| MaxcatError::corrupt(path, "bad digram section"))?;
		let features = FeatureTable { backing, offset: digram_end, mask: (1usize << header.hash_bits) - 1, codec };
		Ok(Self { header, digrams, features })
	}

	pub fn header(&self) -> &CategoryHeader {
		&self.header
	}

	pub fn name(&self) -> &str {
		&self.header.name
	}

	pub fn digrams(&self) -> &DigramTable {
		&self.digrams
	}

	pub fn features(&self) -> &FeatureTable {
		&self.features
	}

	pub fn weight(&self, id: u64) -> Option<f64> {
		self.features.lookup(id)
	}

	/// Digramic excursion of a token text under this category's reference.
	pub fn excursion(&self, text: &[u8]) -> f64 {
		self.digrams.excursion(text)
	}

	/// Score contribution of `token`.
	///
	/// # Behavior
	/// - A feature adds its weight; order-1 features also add their
	///   excursion minus `logZ`.
	/// - An unknown order-1 token adds its excursion only.
	/// - An unknown higher-order token adds nothing, its parts are scored
	///   as unigrams on their own.
	pub fn contribution(&self, token: &Token) -> Contribution {
		let order = if self.header.options.multinomial { 1 } else { token.order() };
		match self.weight(token.id()) {
			Some(lambda) if order == 1 => {
				Contribution { value: lambda + self.excursion(token.text()) - self.header.log_z, known: true }
			}
			Some(lambda) => Contribution { value: lambda, known: true },
			None if order == 1 => Contribution { value: self.excursion(token.text()), known: false },
			None => Contribution { value: 0.0, known: false },
		}
	}

	pub fn log_z(&self) -> f64 {
		self.header.log_z
	}

	pub fn shannon(&self) -> f64 {
		self.header.entropy.shannon
	}

	pub fn shannon_variance(&self) -> f64 {
		self.header.entropy.shannon2
	}

	pub fn media_probs(&self) -> [f64; TokenClass::COUNT] {
		self.header.media_probs()
	}

	/// Average number of tokens per learned document, zero if none.
	pub fn mean_document_length(&self) -> f64 {
		match self.header.doc_count {
			0 => 0.0,
			n => self.header.full_token_count as f64 / n as f64,
		}
	}
}

fn map_file(path: &Path) -> io::Result<Mmap> {
	let file = File::open(path)?;
	// SAFETY: saves replace category files by rename and never resize them
	// in place; a fast partial save only rewrites bytes within the length
	let map = unsafe { Mmap::map(&file)? };
	map_hints(&map, false);
	Ok(map)
}
