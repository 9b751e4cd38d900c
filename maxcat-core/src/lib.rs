//! Maximum-entropy text categorization library.
//!
//! This crate learns one statistical model per text category and scores
//! documents against a set of saved categories:
//! - Token counting into a growable feature table, with a spool of token text
//! - Character digram reference measures with several smoothing strategies
//! - Iterative scaling of hierarchical n-gram feature weights
//! - Category files, resumable online dumps and in-place updates
//! - Classification with posterior probabilities
//!
//! Tokenization is left to the caller; tokens arrive already encoded
//! (see [`token::Token`]).

/// Run configuration, tolerance presets and TOML loading.
pub mod config;

/// Error type and the sticky warning flags.
pub mod error;

/// Category files, online dumps and their shared file helpers.
pub mod io;

/// Learning, fitting, merging and scoring.
pub mod model;

/// Per-run context: configuration, random source and interruption flag.
pub mod session;

/// Encoded tokens and their classes.
pub mod token;

/// Weight encodings and byte order of binary records.
pub mod weight;

pub use config::{ModelOptions, SessionConfig, Smoothing};
pub use error::{MaxcatError, Result, Warning, Warnings};
pub use model::category::Category;
pub use model::learner::Learner;
pub use model::scorer::{Classifier, Verdict};
pub use model::sink::{Sink, TokenSink};
pub use session::{Interrupt, Session};
pub use token::{Token, TokenClass};
