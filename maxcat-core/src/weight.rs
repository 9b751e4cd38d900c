//! Weight encodings and byte order for the binary sections of category files.
//!
//! Every weight that ends up on disk is first passed through
//! [`WeightEncoding::quantize`], so the in-memory model and a model loaded
//! back from disk hold exactly the same values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scale of the fixed-point encoding (16 fractional bits).
const FIXED_SCALE: f64 = 65536.0;

/// How a single weight is stored in four bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightEncoding {
	/// IEEE single precision.
	#[default]
	Float,
	/// Signed 16.16 fixed point.
	Digitized,
}

impl WeightEncoding {
	/// Bytes per encoded weight, identical for both encodings.
	pub const WIDTH: usize = 4;

	pub fn to_raw(self, value: f64) -> u32 {
		match self {
			WeightEncoding::Float => (value as f32).to_bits(),
			// `as` saturates at the i32 bounds and maps NaN to zero
			WeightEncoding::Digitized => ((value * FIXED_SCALE).round() as i32) as u32,
		}
	}

	pub fn from_raw(self, raw: u32) -> f64 {
		match self {
			WeightEncoding::Float => f32::from_bits(raw) as f64,
			WeightEncoding::Digitized => (raw as i32) as f64 / FIXED_SCALE,
		}
	}

	/// Rounds `value` to the nearest representable weight.
	pub fn quantize(self, value: f64) -> f64 {
		self.from_raw(self.to_raw(value))
	}

	pub fn name(self) -> &'static str {
		match self {
			WeightEncoding::Float => "float",
			WeightEncoding::Digitized => "digitized",
		}
	}
}

impl fmt::Display for WeightEncoding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for WeightEncoding {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"float" => Ok(WeightEncoding::Float),
			"digitized" => Ok(WeightEncoding::Digitized),
			_ => Err(format!("unknown weight encoding '{}'", s)),
		}
	}
}

/// Byte order of the binary records.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
	Big,
	Little,
}

impl ByteOrder {
	pub fn native() -> Self {
		if cfg!(target_endian = "big") { ByteOrder::Big } else { ByteOrder::Little }
	}

	/// Big-endian when `portable`, host order otherwise.
	pub fn for_save(portable: bool) -> Self {
		if portable { ByteOrder::Big } else { ByteOrder::native() }
	}

	pub fn put_u32(self, out: &mut [u8], value: u32) {
		let bytes = match self {
			ByteOrder::Big => value.to_be_bytes(),
			ByteOrder::Little => value.to_le_bytes(),
		};
		out[..4].copy_from_slice(&bytes);
	}

	pub fn put_u64(self, out: &mut [u8], value: u64) {
		let bytes = match self {
			ByteOrder::Big => value.to_be_bytes(),
			ByteOrder::Little => value.to_le_bytes(),
		};
		out[..8].copy_from_slice(&bytes);
	}

	pub fn get_u32(self, input: &[u8]) -> u32 {
		let mut bytes = [0u8; 4];
		bytes.copy_from_slice(&input[..4]);
		match self {
			ByteOrder::Big => u32::from_be_bytes(bytes),
			ByteOrder::Little => u32::from_le_bytes(bytes),
		}
	}

	pub fn get_u64(self, input: &[u8]) -> u64 {
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(&input[..8]);
		match self {
			ByteOrder::Big => u64::from_be_bytes(bytes),
			ByteOrder::Little => u64::from_le_bytes(bytes),
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			ByteOrder::Big => "big",
			ByteOrder::Little => "little",
		}
	}
}

impl FromStr for ByteOrder {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"big" => Ok(ByteOrder::Big),
			"little" => Ok(ByteOrder::Little),
			_ => Err(format!("unknown byte order '{}'", s)),
		}
	}
}

/// Encoding and byte order of a weight array, bundled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightCodec {
	pub encoding: WeightEncoding,
	pub order: ByteOrder,
}

impl WeightCodec {
	pub fn new(encoding: WeightEncoding, order: ByteOrder) -> Self {
		Self { encoding, order }
	}

	pub fn write(&self, out: &mut [u8], value: f64) {
		self.order.put_u32(out, self.encoding.to_raw(value));
	}

	pub fn read(&self, input: &[u8]) -> f64 {
		self.encoding.from_raw(self.order.get_u32(input))
	}
}
