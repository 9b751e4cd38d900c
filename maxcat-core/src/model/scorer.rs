use std::path::Path;

use tracing::debug;

use super::category::{Category, Contribution};
use crate::error::Result;
use crate::session::Session;
use crate::token::Token;

/// Running score of the current document against one category.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DocumentScore {
	pub score: f64,
	/// Tokens scored.
	pub complexity: u64,
	/// Tokens that are not features of the category.
	pub misses: u64,
	pub sum_squares: f64,
}

impl DocumentScore {
	fn add(&mut self, contribution: Contribution) {
		self.score += contribution.value;
		self.sum_squares += contribution.value * contribution.value;
		self.complexity += 1;
		if !contribution.known {
			self.misses += 1;
		}
	}
}

/// Outcome of classifying one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
	/// Position of the winning category, ties going to the first.
	pub best: usize,
	/// Final score per category.
	pub scores: Vec<f64>,
	/// Posterior probability per category, in percent.
	pub posteriors: Vec<f64>,
}

impl Verdict {
	/// Builds a verdict from final scores.
	///
	/// # Returns
	/// `None` when there are no scores.
	pub fn from_scores(scores: Vec<f64>) -> Option<Self> {
		let mut best = 0;
		for (i, &s) in scores.iter().enumerate().skip(1) {
			if s > scores[best] {
				best = i;
			}
		}
		let max = *scores.get(best)?;
		let posteriors = if max.is_finite() {
			let weights: Vec<f64> = scores.iter().map(|&s| (s - max).exp()).collect();
			let total: f64 = weights.iter().sum();
			weights.into_iter().map(|w| 100.0 * w / total).collect()
		} else {
			vec![100.0 / scores.len() as f64; scores.len()]
		};
		Some(Self { best, scores, posteriors })
	}

	/// One-based index of the winner, as used for exit statuses.
	pub fn index(&self) -> usize {
		self.best + 1
	}
}

/// Scores documents against a fixed set of categories.
///
/// # Behavior
/// Tokens are fed one at a time; [`Classifier::finish_document`] turns the
/// running scores into a [`Verdict`] and starts the next document.
pub struct Classifier {
	categories: Vec<Category>,
	scores: Vec<DocumentScore>,
	prior_correction: bool,
	last: Option<Verdict>,
}

impl Classifier {
	pub fn new(categories: Vec<Category>, prior_correction: bool) -> Self {
		let scores = vec![DocumentScore::default(); categories.len()];
		Self { categories, scores, prior_correction, last: None }
	}

	/// Loads every category file in `paths`, honouring the session's mapping
	/// and prior settings.
	pub fn open<P: AsRef<Path>>(session: &Session, paths: &[P]) -> Result<Self> {
		let categories = paths
			.iter()
			.map(|p| Category::open(p, session.config.save.mmap))
			.collect::<Result<Vec<_>>>()?;
		Ok(Self::new(categories, session.config.prior_correction))
	}

	pub fn categories(&self) -> &[Category] {
		&self.categories
	}

	pub fn scores(&self) -> &[DocumentScore] {
		&self.scores
	}

	pub fn last_verdict(&self) -> Option<&Verdict> {
		self.last.as_ref()
	}

	pub fn score_token(&mut self, token: &Token) {
		for (category, score) in self.categories.iter().zip(self.scores.iter_mut()) {
			score.add(category.contribution(token));
		}
	}

	/// Verdict for the tokens fed since the last document ended.
	///
	/// With prior correction, each score gains the Poisson log-likelihood of
	/// the document length under the category's mean document length.
	pub fn verdict(&self) -> Option<Verdict> {
		let scores = self
			.categories
			.iter()
			.zip(&self.scores)
			.map(|(category, score)| {
				let mean = category.mean_document_length();
				if self.prior_correction && mean > 0.0 {
					score.score + score.complexity as f64 * mean.ln() - mean
				} else {
					score.score
				}
			})
			.collect();
		Verdict::from_scores(scores)
	}

	/// Ends the document and resets the running scores.
	pub fn finish_document(&mut self) -> Option<&Verdict> {
		self.last = self.verdict();
		if let Some(verdict) = &self.last {
			debug!(
				best = %self.categories[verdict.best].name(),
				tokens = self.scores[verdict.best].complexity,
				"classified document"
			);
		}
		self.scores.iter_mut().for_each(|s| *s = DocumentScore::default());
		self.last.as_ref()
	}
}
