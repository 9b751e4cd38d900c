//! Structured configuration for learning and classification runs.
//!
//! [`ModelOptions`] is persisted with every category and must match for
//! in-place updates. Everything else in [`SessionConfig`] only affects the
//! run that uses it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::weight::WeightEncoding;

/// Digram smoothing strategy used to build the reference measure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Smoothing {
	/// Every transition equally likely.
	#[default]
	Uniform,
	/// MacKay-Peto hierarchical Dirichlet estimate.
	Dirichlet,
	/// Per-row maximum entropy fit.
	MaxEnt,
	/// Row frequencies with a floor on unseen transitions.
	Mle,
	/// Characters independent of their predecessor.
	Iid,
	/// Only the token length carries information.
	TokLen,
}

impl Smoothing {
	pub const ALL: [Smoothing; 6] =
		[Smoothing::Uniform, Smoothing::Dirichlet, Smoothing::MaxEnt, Smoothing::Mle, Smoothing::Iid, Smoothing::TokLen];

	pub fn name(self) -> &'static str {
		match self {
			Smoothing::Uniform => "uniform",
			Smoothing::Dirichlet => "dirichlet",
			Smoothing::MaxEnt => "maxent",
			Smoothing::Mle => "mle",
			Smoothing::Iid => "iid",
			Smoothing::TokLen => "toklen",
		}
	}
}

impl fmt::Display for Smoothing {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for Smoothing {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Smoothing::ALL.into_iter().find(|v| v.name() == s).ok_or_else(|| format!("unknown smoothing '{}'", s))
	}
}

/// Options that shape the model itself and are stored in the category file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ModelOptions {
	/// Fold every n-gram into order 1 (no hierarchy).
	pub multinomial: bool,
	/// Keep only the reference measure, all weights stay at zero.
	pub reference_only: bool,
	/// Track per-document entropy statistics.
	pub document_entropy: bool,
	pub smoothing: Smoothing,
	pub encoding: WeightEncoding,
	/// Features seen at most this many times get a zero weight.
	pub min_count: u32,
}

impl Default for ModelOptions {
	fn default() -> Self {
		Self {
			multinomial: false,
			reference_only: false,
			document_entropy: false,
			smoothing: Smoothing::Uniform,
			encoding: WeightEncoding::Float,
			min_count: 0,
		}
	}
}

/// Convergence tolerances for the digram and feature fits.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct Tolerances {
	pub divergence: f64,
	pub lambda: f64,
	pub log_z: f64,
	/// Repeat the whole per-order fit until the partition function settles.
	pub multipass: bool,
	/// Largest change applied to a single weight per iteration.
	pub max_lambda_jump: f64,
	/// Dirichlet concentration tolerance.
	pub alpha: f64,
	pub digram_divergence: f64,
	pub digram_lambda: f64,
	pub digram_log_z: f64,
}

impl Default for Tolerances {
	fn default() -> Self {
		Self::quality(1)
	}
}

impl Tolerances {
	/// Tolerance preset for quality levels 1 (fast) through 4 (thorough).
	///
	/// Levels outside `1..=4` are clamped.
	pub fn quality(level: u8) -> Self {
		let (divergence, lambda, log_z, multipass) = match level.clamp(1, 4) {
			1 => (0.01, 0.05, 0.05, false),
			2 => (0.01, 0.01, 0.05, false),
			3 => (0.01, 0.01, 0.01, false),
			_ => (0.01, 0.01, 0.01, true),
		};
		Self {
			divergence,
			lambda,
			log_z,
			multipass,
			max_lambda_jump: 100.0,
			alpha: 1e-4,
			digram_divergence: 0.001,
			digram_lambda: 0.001,
			digram_log_z: 0.001,
		}
	}
}

/// Sizing and growth policy of the feature table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
	/// Initial capacity is `2^hash_bits`.
	pub hash_bits: u8,
	/// Growth stops once the capacity reaches `2^max_hash_bits`.
	pub max_hash_bits: u8,
	pub growable: bool,
	/// Load factor, in percent, at which the table grows.
	pub load_percent: u8,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self { hash_bits: 15, max_hash_bits: 22, growable: true, load_percent: 90 }
	}
}

/// How category files are written.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SaveOptions {
	/// Write arrays through a memory map when the destination exists.
	pub mmap: bool,
	/// Store binary records big-endian regardless of the host.
	pub portable: bool,
	/// Try an in-place update of an existing file before a full save.
	pub fast_partial: bool,
	/// Pin mapped regions in memory while they are in use.
	pub lock_memory: bool,
}

/// Everything a learning or classification run needs to know.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct SessionConfig {
	pub model: ModelOptions,
	pub store: StoreConfig,
	pub tolerances: Tolerances,
	pub save: SaveOptions,
	/// Keep a reservoir of documents to estimate score confidence.
	pub confidence: bool,
	/// Seed the fit with the weights of the category being replaced.
	pub prefill_lambdas: bool,
	/// Memory-map the token spool.
	pub mmap_spool: bool,
	/// Directory for the token spool, system temp dir when unset.
	pub spool_dir: Option<PathBuf>,
	/// Write a resumable online dump here before fitting.
	pub online_dump: Option<PathBuf>,
	/// Seed for reservoir sampling, random when unset.
	pub seed: Option<u64>,
	/// Correct scores for each category's mean document length.
	pub prior_correction: bool,
}

impl SessionConfig {
	/// Parses a TOML document. Missing fields take their default values.
	pub fn from_toml_str(text: &str) -> Result<Self> {
		Ok(toml::from_str(text)?)
	}

	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
		let text = fs::read_to_string(path)?;
		Self::from_toml_str(&text)
	}

	/// Replaces the tolerances with a quality preset.
	pub fn with_quality(mut self, level: u8) -> Self {
		self.tolerances = Tolerances::quality(level);
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn smoothing_names_round_trip() {
		for s in Smoothing::ALL {
			assert_eq!(s.name().parse::<Smoothing>(), Ok(s));
		}
		assert!("bogus".parse::<Smoothing>().is_err());
	}

	#[test]
	fn toml_overrides_defaults() {
		let config = SessionConfig::from_toml_str(
			r#"
			confidence = true

			[model]
			smoothing = "dirichlet"
			encoding = "digitized"

			[store]
			hash_bits = 10
			"#,
		)
		.unwrap();
		assert!(config.confidence);
		assert_eq!(config.model.smoothing, Smoothing::Dirichlet);
		assert_eq!(config.model.encoding, WeightEncoding::Digitized);
		assert_eq!(config.store.hash_bits, 10);
		assert_eq!(config.store.load_percent, 90);
		assert_eq!(config.tolerances, Tolerances::quality(1));
	}

	#[test]
	fn quality_presets_tighten() {
		let q1 = Tolerances::quality(1);
		let q3 = Tolerances::quality(3);
		assert!(q3.log_z < q1.log_z);
		assert!(Tolerances::quality(4).multipass);
		assert_eq!(Tolerances::quality(9), Tolerances::quality(4));
	}
}
