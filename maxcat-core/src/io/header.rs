use std::fmt::Write as _;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use crate::config::{ModelOptions, Smoothing};
use crate::error::{MaxcatError, Result};
use crate::model::document::EntropySummary;
use crate::model::learner::{Learner, RegexSpec};
use crate::token::TokenClass;
use crate::weight::{ByteOrder, WeightEncoding};

/// Leading bytes shared by every version of the category format.
pub const CATEGORY_MAGIC: &str = "#maxcat category v";
/// Format version written by this library.
pub const CATEGORY_VERSION: &str = "1";

const REF_SUFFIX: &str = " (ref)";

/// Text header of a category file.
///
/// Everything needed to interpret the binary sections that follow it, plus
/// the statistics a classifier reports about the category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryHeader {
	pub name: String,
	pub options: ModelOptions,
	pub divergence: f64,
	pub log_z: f64,
	pub max_order: u8,
	pub hash_bits: u8,
	pub full_token_count: u64,
	pub unique_token_count: u64,
	pub doc_count: u64,
	pub entropy: EntropySummary,
	/// `-ln p` of each token class.
	pub media_neglogs: [f64; TokenClass::COUNT],
	pub regexes: Vec<RegexSpec>,
	/// Some counts saturated while learning.
	pub skewed: bool,
	pub byte_order: ByteOrder,
}

/// A header read back from disk, with the offsets the loaders need.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
	pub header: CategoryHeader,
	/// First byte of the digram section.
	pub data_offset: usize,
	/// Bytes holding the numeric lines, from `#divergence` through `#mediaprobs`.
	pub numeric: Range<usize>,
}

impl CategoryHeader {
	/// Header describing `learner` as it would be saved with `byte_order`.
	pub fn from_learner(learner: &Learner, byte_order: ByteOrder) -> Self {
		let fit = learner.fit_summary();
		Self {
			name: learner.name().to_owned(),
			options: learner.options().clone(),
			divergence: fit.divergence,
			log_z: fit.log_z,
			max_order: if learner.options().multinomial { 1 } else { learner.stats().max_order.max(1) },
			hash_bits: learner.store().hash_bits(),
			full_token_count: learner.full_token_count(),
			unique_token_count: learner.unique_token_count() as u64,
			doc_count: learner.document_stats().count,
			entropy: *learner.entropy(),
			media_neglogs: fit.media_probs.map(|p| -p.ln()),
			regexes: learner.regexes().to_vec(),
			skewed: learner.warnings().is_skewed(),
			byte_order,
		}
	}

	/// Probability of each token class under the fitted model.
	pub fn media_probs(&self) -> [f64; TokenClass::COUNT] {
		self.media_neglogs.map(|n| (-n).exp())
	}

	/// The complete header, `#data` line included.
	pub fn render(&self) -> String {
		let mut out = String::new();
		let suffix = if self.options.reference_only { REF_SUFFIX } else { "" };
		let _ = writeln!(out, "{}{} {}{}", CATEGORY_MAGIC, CATEGORY_VERSION, self.name, suffix);
		out.push_str(&self.numeric_lines());
		for regex in &self.regexes {
			let _ = writeln!(out, "#regex {} {}", regex.submatches, regex.pattern.replace('\n', " "));
		}
		let _ = writeln!(
			out,
			"#options reference={} entropy={} skewed={} min_count={} smoothing={} encoding={} byteorder={}",
			self.options.reference_only,
			self.options.document_entropy,
			self.skewed,
			self.options.min_count,
			self.options.smoothing,
			self.options.encoding,
			self.byte_order.name()
		);
		out.push_str("#data\n");
		out
	}

	/// The lines a fast partial save rewrites.
	pub fn numeric_lines(&self) -> String {
		let mut out = String::new();
		let mode = if self.options.multinomial { "multinomial" } else { "hierarchical" };
		let _ = writeln!(out, "#divergence {} logZ {} order {} {}", self.divergence, self.log_z, self.max_order, mode);
		let _ = writeln!(
			out,
			"#hash_bits {} features {} unique {} documents {}",
			self.hash_bits, self.full_token_count, self.unique_token_count, self.doc_count
		);
		let _ = writeln!(out, "#shannon {} {}", self.entropy.shannon, self.entropy.shannon2);
		let e = &self.entropy;
		let _ = writeln!(out, "#confidence alpha {} beta {} mu {} s2 {}", e.alpha, e.beta, e.mu, e.s2);
		out.push_str("#mediaprobs");
		for n in &self.media_neglogs {
			let _ = write!(out, " {}", n);
		}
		out.push('\n');
		out
	}

	/// Parses the header at the start of `bytes`.
	///
	/// # Errors
	/// - `ForeignFile` if `bytes` does not start with the category magic
	/// - `VersionMismatch` for any other format version
	/// - `Corrupt` for a malformed or truncated header
	pub fn parse(bytes: &[u8], path: &Path) -> Result<ParsedHeader> {
		let mut lines = HeaderLines { bytes, pos: 0, path };

		let first = lines.next().map_err(|_| MaxcatError::ForeignFile { path: path.to_path_buf() })?;
		let Some(versioned) = first.strip_prefix(CATEGORY_MAGIC) else {
			return Err(MaxcatError::ForeignFile { path: path.to_path_buf() });
		};
		let (version, title) = versioned.split_once(' ').unwrap_or((versioned, ""));
		if version != CATEGORY_VERSION {
			return Err(MaxcatError::VersionMismatch { path: path.to_path_buf(), found: version.to_owned() });
		}

		let numeric_start = lines.pos;
		let mut fields = lines.fields("#divergence")?;
		let divergence = fields.value("divergence")?;
		fields.label("logZ")?;
		let log_z = fields.value("logZ")?;
		fields.label("order")?;
		let max_order = fields.value("order")?;
		let multinomial = match fields.word("mode")? {
			"multinomial" => true,
			"hierarchical" => false,
			other => return Err(lines.corrupt(format!("unknown model mode '{}'", other))),
		};

		let mut fields = lines.fields("#hash_bits")?;
		let hash_bits = fields.value("hash_bits")?;
		fields.label("features")?;
		let full_token_count = fields.value("features")?;
		fields.label("unique")?;
		let unique_token_count = fields.value("unique")?;
		fields.label("documents")?;
		let doc_count = fields.value("documents")?;

		let mut entropy = EntropySummary::default();
		let mut fields = lines.fields("#shannon")?;
		entropy.shannon = fields.value("shannon")?;
		entropy.shannon2 = fields.value("shannon2")?;

		let mut fields = lines.fields("#confidence")?;
		fields.label("alpha")?;
		entropy.alpha = fields.value("alpha")?;
		fields.label("beta")?;
		entropy.beta = fields.value("beta")?;
		fields.label("mu")?;
		entropy.mu = fields.value("mu")?;
		fields.label("s2")?;
		entropy.s2 = fields.value("s2")?;

		let mut fields = lines.fields("#mediaprobs")?;
		let mut media_neglogs = [0.0; TokenClass::COUNT];
		for n in media_neglogs.iter_mut() {
			*n = fields.value("mediaprobs")?;
		}
		let numeric = numeric_start..lines.pos;

		let mut regexes = Vec::new();
		let options_line = loop {
			let line = lines.next()?;
			match line.strip_prefix("#regex ") {
				Some(rest) => {
					let (submatches, pattern) = rest.split_once(' ').unwrap_or((rest, ""));
					regexes.push(RegexSpec { pattern: pattern.to_owned(), submatches: submatches.to_owned() });
				}
				None => break line,
			}
		};
		let Some(options_text) = options_line.strip_prefix("#options") else {
			return Err(lines.corrupt("missing #options line"));
		};
		let mut options = ModelOptions { multinomial, ..ModelOptions::default() };
		let mut skewed = false;
		let mut byte_order = None;
		for pair in options_text.split_whitespace() {
			let (key, value) = pair.split_once('=').ok_or_else(|| lines.corrupt(format!("bad option '{}'", pair)))?;
			match key {
				"reference" => options.reference_only = lines.parse(value, key)?,
				"entropy" => options.document_entropy = lines.parse(value, key)?,
				"skewed" => skewed = lines.parse(value, key)?,
				"min_count" => options.min_count = lines.parse(value, key)?,
				"smoothing" => options.smoothing = lines.parse::<Smoothing>(value, key)?,
				"encoding" => options.encoding = lines.parse::<WeightEncoding>(value, key)?,
				"byteorder" => byte_order = Some(lines.parse::<ByteOrder>(value, key)?),
				_ => return Err(lines.corrupt(format!("unknown option '{}'", key))),
			}
		}
		let byte_order = byte_order.ok_or_else(|| lines.corrupt("missing byte order"))?;

		if lines.next()? != "#data" {
			return Err(lines.corrupt("missing #data line"));
		}

		let name = match title.strip_suffix(REF_SUFFIX) {
			Some(stripped) if options.reference_only => stripped,
			_ => title,
		};
		let header = CategoryHeader {
			name: name.to_owned(),
			options,
			divergence,
			log_z,
			max_order,
			hash_bits,
			full_token_count,
			unique_token_count,
			doc_count,
			entropy,
			media_neglogs,
			regexes,
			skewed,
			byte_order,
		};
		if header.hash_bits == 0 || header.hash_bits > 40 {
			return Err(lines.corrupt(format!("hash size of {} bits", header.hash_bits)));
		}
		Ok(ParsedHeader { header, data_offset: lines.pos, numeric })
	}
}

/// Newline-terminated UTF-8 lines of a header.
struct HeaderLines<'a> {
	bytes: &'a [u8],
	pos: usize,
	path: &'a Path,
}

impl<'a> HeaderLines<'a> {
	fn corrupt(&self, reason: impl Into<String>) -> MaxcatError {
		MaxcatError::corrupt(self.path, reason)
	}

	fn next(&mut self) -> Result<&'a str> {
		let bytes = self.bytes;
		let rest = &bytes[self.pos..];
		let end = rest.iter().position(|&b| b == b'\n').ok_or_else(|| self.corrupt("truncated header"))?;
		let line = std::str::from_utf8(&rest[..end]).map_err(|_| self.corrupt("header is not UTF-8"))?;
		self.pos += end + 1;
		Ok(line)
	}

	/// Next line, which must start with the word `tag`.
	fn fields(&mut self, tag: &str) -> Result<Fields<'a>> {
		let line = self.next()?;
		let mut words = line.split_whitespace();
		if words.next() != Some(tag) {
			return Err(self.corrupt(format!("expected {} line", tag)));
		}
		Ok(Fields { words, path: self.path })
	}

	fn parse<T: FromStr>(&self, value: &str, what: &str) -> Result<T> {
		value.parse().map_err(|_| self.corrupt(format!("bad {} '{}'", what, value)))
	}
}

struct Fields<'a> {
	words: std::str::SplitWhitespace<'a>,
	path: &'a Path,
}

impl<'a> Fields<'a> {
	fn word(&mut self, what: &str) -> Result<&'a str> {
		self.words.next().ok_or_else(|| MaxcatError::corrupt(self.path, format!("missing {}", what)))
	}

	fn label(&mut self, label: &str) -> Result<()> {
		match self.word(label)? {
			word if word == label => Ok(()),
			word => Err(MaxcatError::corrupt(self.path, format!("expected '{}', found '{}'", label, word))),
		}
	}

	fn value<T: FromStr>(&mut self, what: &str) -> Result<T> {
		let word = self.word(what)?;
		word.parse().map_err(|_| MaxcatError::corrupt(self.path, format!("bad {} '{}'", what, word)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> CategoryHeader {
		CategoryHeader {
			name: "spam mail".to_owned(),
			options: ModelOptions { smoothing: Smoothing::Dirichlet, min_count: 2, ..ModelOptions::default() },
			divergence: 1.25,
			log_z: 0.1 + 0.2,
			max_order: 3,
			hash_bits: 15,
			full_token_count: 1000,
			unique_token_count: 120,
			doc_count: 7,
			entropy: EntropySummary { shannon: 4.5, shannon2: 0.25, alpha: 1.0, beta: 2.0, mu: 3.0, s2: 6.0 },
			media_neglogs: [0.01, f64::INFINITY, 9.5, 12.0, 30.0, 7.25],
			regexes: vec![RegexSpec { pattern: "[[:alpha:]]+ ([a-z]+)".to_owned(), submatches: "01".to_owned() }],
			skewed: true,
			byte_order: ByteOrder::Big,
		}
	}

	#[test]
	fn render_then_parse() {
		let header = sample();
		let text = header.render();
		let parsed = CategoryHeader::parse(text.as_bytes(), Path::new("spam")).unwrap();
		assert_eq!(parsed.header, header);
		assert_eq!(parsed.data_offset, text.len());
		assert_eq!(&text[parsed.numeric.clone()], header.numeric_lines());
	}

	#[test]
	fn reference_models_keep_their_name() {
		let mut header = sample();
		header.options.reference_only = true;
		let text = header.render();
		assert!(text.starts_with("#maxcat category v1 spam mail (ref)\n"));
		let parsed = CategoryHeader::parse(text.as_bytes(), Path::new("spam")).unwrap();
		assert_eq!(parsed.header.name, "spam mail");
	}

	#[test]
	fn magic_and_version_are_checked() {
		let path = Path::new("x");
		assert!(matches!(CategoryHeader::parse(b"hello\n", path), Err(MaxcatError::ForeignFile { .. })));
		assert!(matches!(CategoryHeader::parse(b"", path), Err(MaxcatError::ForeignFile { .. })));
		let newer = sample().render().replacen("v1", "v2", 1);
		match CategoryHeader::parse(newer.as_bytes(), path) {
			Err(MaxcatError::VersionMismatch { found, .. }) => assert_eq!(found, "2"),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn truncated_header_is_corrupt() {
		let text = sample().render();
		let cut = &text.as_bytes()[..text.len() - 3];
		assert!(matches!(CategoryHeader::parse(cut, Path::new("x")), Err(MaxcatError::Corrupt { .. })));
	}
}
