use std::collections::HashMap;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Documents kept for confidence estimation.
pub const RESERVOIR_SIZE: usize = 100;

/// Streaming statistics over learned documents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct DocumentStats {
	/// Sum of per-document entropies.
	pub entropy_sum: f64,
	/// Sum of squared per-document entropies.
	pub entropy_sq_sum: f64,
	/// Non-empty documents.
	pub count: u64,
	pub empty_count: u64,
}

impl DocumentStats {
	pub fn add(&mut self, other: &DocumentStats) {
		self.entropy_sum += other.entropy_sum;
		self.entropy_sq_sum += other.entropy_sq_sum;
		self.count += other.count;
		self.empty_count += other.empty_count;
	}

	pub fn mean_entropy(&self) -> f64 {
		if self.count == 0 { 0.0 } else { self.entropy_sum / self.count as f64 }
	}

	/// Sample variance of the per-document entropy.
	pub fn entropy_variance(&self) -> f64 {
		if self.count < 2 {
			return 0.0;
		}
		let n = self.count as f64;
		((n * self.entropy_sq_sum - self.entropy_sum * self.entropy_sum) / (n * (n - 1.0))).max(0.0)
	}
}

/// Entropy and confidence figures derived after a fit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct EntropySummary {
	pub shannon: f64,
	pub shannon2: f64,
	pub alpha: f64,
	pub beta: f64,
	pub mu: f64,
	pub s2: f64,
}

impl EntropySummary {
	pub(crate) fn clear_confidence(&mut self) {
		self.alpha = 0.0;
		self.beta = 0.0;
		self.mu = 0.0;
		self.s2 = 0.0;
	}
}

/// One document as seen by the confidence estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSample {
	/// Feature ids with the share of the document each occupied.
	pub shares: Vec<(u64, f64)>,
	pub entropy: f64,
}

/// Occurrences of each feature in the document being learned.
#[derive(Debug, Default)]
pub(crate) struct DocumentTally {
	counts: HashMap<u64, u32>,
	tokens: u64,
}

impl DocumentTally {
	/// Records one occurrence.
	///
	/// # Returns
	/// `false` if memory for the tally could not be reserved.
	pub fn record(&mut self, id: u64) -> bool {
		if !self.counts.contains_key(&id) && self.counts.try_reserve(1).is_err() {
			return false;
		}
		*self.counts.entry(id).or_insert(0) += 1;
		self.tokens += 1;
		true
	}

	/// Counts a token without tracking its id.
	pub fn count_only(&mut self) {
		self.tokens += 1;
	}

	pub fn tokens(&self) -> u64 {
		self.tokens
	}

	/// Ends the document, returning each feature's share and the entropy.
	pub fn finish(&mut self) -> Option<DocumentSample> {
		let tokens = std::mem::take(&mut self.tokens);
		let counts = std::mem::take(&mut self.counts);
		if counts.is_empty() || tokens == 0 {
			return None;
		}
		let total = counts.values().map(|&c| c as f64).sum::<f64>();
		let mut entropy = 0.0;
		let mut shares: Vec<(u64, f64)> = counts
			.into_iter()
			.map(|(id, c)| {
				let share = c as f64 / total;
				entropy -= share * share.ln();
				(id, share)
			})
			.collect();
		shares.sort_by_key(|&(id, _)| id);
		Some(DocumentSample { shares, entropy })
	}
}

/// Uniform random sample of at most [`RESERVOIR_SIZE`] documents.
#[derive(Debug)]
pub struct Reservoir {
	samples: Vec<DocumentSample>,
	seen: u64,
	rng: StdRng,
}

impl Reservoir {
	pub fn new(rng: StdRng) -> Self {
		Self { samples: Vec::new(), seen: 0, rng }
	}

	/// Offers a document; it is kept with probability `RESERVOIR_SIZE / seen`.
	pub fn offer(&mut self, sample: DocumentSample) {
		self.seen += 1;
		if self.samples.len() < RESERVOIR_SIZE {
			self.samples.push(sample);
			return;
		}
		let slot = self.rng.random_range(0..self.seen);
		if let Some(kept) = self.samples.get_mut(slot as usize) {
			*kept = sample;
		}
	}

	pub fn samples(&self) -> &[DocumentSample] {
		&self.samples
	}

	pub fn seen(&self) -> u64 {
		self.seen
	}
}
