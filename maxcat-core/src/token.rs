//! Token encoding shared with the external tokenizer.
//!
//! A token of order `n` is the byte string `◇s1◇s2…◇sn◇`, where `◇` is
//! [`DIAMOND`]. Its identity is a 64-bit hash of that text seeded with the
//! token class, so the same word in a header and in a body are different
//! features.

use std::fmt;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{MaxcatError, Result};

/// Subtoken separator, also the first symbol of the digram alphabet.
pub const DIAMOND: u8 = 0x02;
/// Separates token text from its class byte in a spool record.
pub const CLASSEP: u8 = 0x03;
/// Terminates a spool record.
pub const TOKENSEP: u8 = 0x00;
/// Highest n-gram order a token may have.
pub const MAX_ORDER: u8 = 9;

/// Media tag attached to every token by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TokenClass {
	Text = 0,
	Header = 1,
	Markup = 2,
	Link = 3,
	Attachment = 4,
	Meta = 5,
}

impl TokenClass {
	pub const COUNT: usize = 6;
	pub const ALL: [TokenClass; TokenClass::COUNT] = [
		TokenClass::Text,
		TokenClass::Header,
		TokenClass::Markup,
		TokenClass::Link,
		TokenClass::Attachment,
		TokenClass::Meta,
	];

	pub fn index(self) -> usize {
		self as usize
	}

	pub fn from_index(index: usize) -> Option<Self> {
		Self::ALL.get(index).copied()
	}

	/// Printable byte used in spool records, never a reserved byte.
	fn code(self) -> u8 {
		b'a' + self as u8
	}

	fn from_code(code: u8) -> Option<Self> {
		code.checked_sub(b'a').and_then(|i| Self::from_index(i as usize))
	}
}

/// An encoded token ready for learning or scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
	text: Vec<u8>,
	class: TokenClass,
}

impl Token {
	/// Builds an order-1 token from a single word.
	pub fn unigram(word: &[u8], class: TokenClass) -> Result<Self> {
		Self::from_subtokens(&[word], class)
	}

	/// Builds a token of order `parts.len()`.
	///
	/// # Errors
	/// `InvalidToken` if there are no parts, more than [`MAX_ORDER`] parts,
	/// an empty part, or a part containing one of the reserved bytes `0x00..=0x03`.
	pub fn from_subtokens<S: AsRef<[u8]>>(parts: &[S], class: TokenClass) -> Result<Self> {
		if parts.is_empty() || parts.len() > MAX_ORDER as usize {
			return Err(MaxcatError::InvalidToken(format!("order {} is out of range", parts.len())));
		}
		let mut text = Vec::with_capacity(parts.iter().map(|p| p.as_ref().len() + 1).sum::<usize>() + 1);
		text.push(DIAMOND);
		for part in parts {
			let part = part.as_ref();
			if part.is_empty() {
				return Err(MaxcatError::InvalidToken("empty subtoken".to_owned()));
			}
			if part.iter().any(|&b| b <= CLASSEP) {
				return Err(MaxcatError::InvalidToken(format!(
					"subtoken '{}' contains a reserved byte",
					String::from_utf8_lossy(part)
				)));
			}
			text.extend_from_slice(part);
			text.push(DIAMOND);
		}
		Ok(Self { text, class })
	}

	/// Wraps text that is already in `◇s1◇…◇sn◇` form.
	pub fn from_encoded(text: Vec<u8>, class: TokenClass) -> Result<Self> {
		let well_formed = text.len() >= 3
			&& text.first() == Some(&DIAMOND)
			&& text.last() == Some(&DIAMOND)
			&& !text.windows(2).any(|w| w == [DIAMOND, DIAMOND])
			&& !text.iter().any(|&b| b < DIAMOND || b == CLASSEP);
		if !well_formed {
			return Err(MaxcatError::InvalidToken(format!("malformed token '{}'", String::from_utf8_lossy(&text))));
		}
		let token = Self { text, class };
		if token.order() > MAX_ORDER {
			return Err(MaxcatError::InvalidToken(format!("order {} is out of range", token.order())));
		}
		Ok(token)
	}

	pub fn text(&self) -> &[u8] {
		&self.text
	}

	pub fn class(&self) -> TokenClass {
		self.class
	}

	/// Number of subtokens, i.e. separators after the leading one.
	pub fn order(&self) -> u8 {
		order_of(&self.text)
	}

	pub fn id(&self) -> u64 {
		token_id(&self.text, self.class)
	}

	/// Ids of the proper suffixes `◇sk…◇sn◇` for `k > 1`.
	pub fn suffix_ids(&self) -> impl Iterator<Item = u64> + '_ {
		let class = self.class;
		let last = self.text.len() - 1;
		(1..last).filter(move |&i| self.text[i] == DIAMOND).map(move |i| token_id(&self.text[i..], class))
	}

	/// Appends the spool record `text CLASSEP class TOKENSEP`.
	pub(crate) fn write_record(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.text);
		out.push(CLASSEP);
		out.push(self.class.code());
		out.push(TOKENSEP);
	}

	/// Length of the spool record written by `write_record`.
	pub(crate) fn record_len(&self) -> usize {
		self.text.len() + 3
	}

	/// Parses a spool record without its trailing `TOKENSEP`.
	///
	/// # Returns
	/// `None` unless the record holds well-formed token text and a known class.
	pub(crate) fn from_record(record: &[u8]) -> Option<Self> {
		match record {
			[text @ .., sep, code] if *sep == CLASSEP => {
				Self::from_encoded(text.to_vec(), TokenClass::from_code(*code)?).ok()
			}
			_ => None,
		}
	}
}

impl fmt::Display for Token {
	/// Subtokens separated by spaces, with a class suffix for non-text tokens.
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let inner = &self.text[1..self.text.len() - 1];
		let words: Vec<_> = inner.split(|&b| b == DIAMOND).map(String::from_utf8_lossy).collect();
		write!(f, "{}", words.join(" "))?;
		if self.class != TokenClass::Text {
			write!(f, " [{:?}]", self.class)?;
		}
		Ok(())
	}
}

pub(crate) fn order_of(text: &[u8]) -> u8 {
	text.iter().skip(1).filter(|&&b| b == DIAMOND).count().min(u8::MAX as usize) as u8
}

/// Feature id of encoded token text. Never zero.
pub(crate) fn token_id(text: &[u8], class: TokenClass) -> u64 {
	match xxh3_64_with_seed(text, class as u64) {
		0 => 1,
		id => id,
	}
}
