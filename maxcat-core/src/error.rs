//! Error types for maxcat.
//!
//! Errors come in three tiers:
//! - fatal errors, which leave the model in an unusable state (`is_fatal`)
//! - recoverable errors, which the caller may retry or report
//! - warnings, which never surface as `Err` and are tracked by [`Warnings`]

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// maxcat error types.
#[derive(Error, Debug)]
pub enum MaxcatError {
	/// Underlying I/O failure
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// Atomic save failed, the destination was left untouched
	#[error("could not save {path}: {source}")]
	SaveFailed {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// File exists but was not written by this library
	#[error("{path} is not a maxcat file")]
	ForeignFile { path: PathBuf },

	/// File was written by an incompatible format version
	#[error("{path} has unsupported format version '{found}'")]
	VersionMismatch { path: PathBuf, found: String },

	/// Structurally inconsistent persisted data
	#[error("{path} is corrupt: {reason}")]
	Corrupt { path: PathBuf, reason: String },

	/// Token does not follow the encoding contract
	#[error("invalid token: {0}")]
	InvalidToken(String),

	/// Partition function overflowed or became NaN
	#[error("partition function for order {order} is not finite")]
	NumericalBlowup { order: u8 },

	/// Models tokenized with different regexes cannot be merged
	#[error("cannot merge models with different regex configurations")]
	RegexMismatch,

	/// Operation requires a fitted model
	#[error("model '{0}' has not been fitted")]
	NotFitted(String),

	/// Cooperative interruption was requested
	#[error("interrupted")]
	Interrupted,

	/// Online dump image could not be encoded or decoded
	#[error("serialization error: {0}")]
	Serialization(#[from] postcard::Error),

	/// Configuration could not be parsed
	#[error("configuration error: {0}")]
	Config(#[from] toml::de::Error),
}

impl MaxcatError {
	/// Whether the error leaves the run unable to continue.
	///
	/// Fatal errors are numerical blow-ups, corrupt persisted state and
	/// raw I/O failures on essential files. Everything else can be retried,
	/// reported or worked around by the caller.
	pub fn is_fatal(&self) -> bool {
		matches!(self, MaxcatError::NumericalBlowup { .. } | MaxcatError::Corrupt { .. } | MaxcatError::Io(_))
	}

	pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
		MaxcatError::Corrupt { path: path.into(), reason: reason.into() }
	}
}

/// Result type alias for maxcat operations.
pub type Result<T> = std::result::Result<T, MaxcatError>;

/// Degraded-but-continuing conditions.
///
/// Each one is logged the first time it is raised and never again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
	CountOverflow,
	DigramOverflow,
	SkewedConstraints,
	GrowthDisabled,
	TableFull,
	EntropyDisabled,
	DirichletNotConverged,
	NoUnigrams,
}

impl Warning {
	const ALL: [Warning; 8] = [
		Warning::CountOverflow,
		Warning::DigramOverflow,
		Warning::SkewedConstraints,
		Warning::GrowthDisabled,
		Warning::TableFull,
		Warning::EntropyDisabled,
		Warning::DirichletNotConverged,
		Warning::NoUnigrams,
	];

	fn bit(self) -> u16 {
		1 << (self as u16)
	}

	fn message(self) -> &'static str {
		match self {
			Warning::CountOverflow => "feature count saturated, further counts are clipped",
			Warning::DigramOverflow => "digram count saturated, further counts are clipped",
			Warning::SkewedConstraints => "token totals saturated, model constraints are skewed",
			Warning::GrowthDisabled => "feature table can no longer grow, new features will be dropped",
			Warning::TableFull => "feature table is full, new features are being dropped",
			Warning::EntropyDisabled => "out of memory for document statistics, entropy tracking disabled",
			Warning::DirichletNotConverged => "dirichlet smoothing did not converge",
			Warning::NoUnigrams => "no unigrams seen, falling back to a multinomial model",
		}
	}

	/// Warnings that make the fitted constraints untrustworthy.
	pub fn is_skewing(self) -> bool {
		matches!(self, Warning::CountOverflow | Warning::DigramOverflow | Warning::SkewedConstraints)
	}
}

/// Sticky set of raised warnings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Warnings {
	raised: u16,
}

impl Warnings {
	/// Raises `warning`, logging it if this is the first time.
	///
	/// # Returns
	/// `true` if the warning was newly raised.
	pub fn raise(&mut self, context: &str, warning: Warning) -> bool {
		if self.is_raised(warning) {
			return false;
		}
		self.raised |= warning.bit();
		warn!(model = context, "{}", warning.message());
		true
	}

	pub fn is_raised(&self, warning: Warning) -> bool {
		self.raised & warning.bit() != 0
	}

	/// Whether any warning that skews the model has been raised.
	pub fn is_skewed(&self) -> bool {
		Warning::ALL.iter().any(|w| w.is_skewing() && self.is_raised(*w))
	}

	/// Combines the flags of two models, without logging.
	pub fn absorb(&mut self, other: Warnings) {
		self.raised |= other.raised;
	}

	pub(crate) fn bits(&self) -> u16 {
		self.raised
	}

	pub(crate) fn from_bits(raised: u16) -> Self {
		Self { raised }
	}
}
