//! Models of text categories.
//!
//! A category is learned by a [`learner::Learner`] and, once fitted and
//! saved, scored through a [`category::Category`]:
//! - Counting (`FeatureStore`, `TokenSpool`, `DigramTable`)
//! - Fitting (`MaxEntFitter`)
//! - Combining learners (`merge`)
//! - Classifying (`Classifier`)

/// A saved category, loaded for scoring.
///
/// Holds the header statistics, the smoothed digram table and a read-only
/// feature table that may live in a memory map.
pub mod category;

/// Character transition counts and their smoothing into a reference measure.
pub mod digram;

/// Per-document entropy statistics and the confidence reservoir.
pub mod document;

/// Open-addressing table of features with in-place doubling growth.
pub mod feature_store;

/// Iterative scaling of feature weights.
pub mod fitter;

/// Counting tokens and driving the fit and save of one category.
pub mod learner;

/// Combining the counts of two learners.
mod merger;

/// Classification of documents against several categories.
pub mod scorer;

/// Token consumers selected once per run.
pub mod sink;

/// Append-only spool of token text, replayed by the fitter.
pub mod token_spool;
