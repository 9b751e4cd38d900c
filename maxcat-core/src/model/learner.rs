use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::category::Category;
use super::digram::DigramTable;
use super::document::{DocumentStats, DocumentTally, EntropySummary, Reservoir};
use super::feature_store::{Feature, FeatureStore, Insert};
use super::fitter::MaxEntFitter;
use super::token_spool::TokenSpool;
use crate::config::{ModelOptions, Tolerances};
use crate::error::{Result, Warning, Warnings};
use crate::io::category_file::PartialSave;
use crate::session::Session;
use crate::token::{MAX_ORDER, Token, TokenClass};

/// Unique-count tolerance for reusing the weights of a previous category.
const PREFILL_TOLERANCE: f64 = 0.15;

/// Regex definition used by the tokenizer that fed a model.
///
/// Only recorded, never evaluated here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegexSpec {
	pub pattern: String,
	/// Digits naming the captured submatches.
	pub submatches: String,
}

/// Token totals of a model.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelStats {
	pub full_token_count: u64,
	/// Tokens seen, per order.
	pub token_counts: [u64; MAX_ORDER as usize + 1],
	/// Distinct features, per order.
	pub unique_counts: [u64; MAX_ORDER as usize + 1],
	pub max_order: u8,
}

/// Constants produced by the last fit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
	pub log_z: f64,
	pub divergence: f64,
	/// Probability of each token class under the fitted model.
	pub media_probs: [f64; TokenClass::COUNT],
	pub fitted: bool,
}

impl Default for FitSummary {
	fn default() -> Self {
		Self { log_z: 0.0, divergence: 0.0, media_probs: [1.0 / TokenClass::COUNT as f64; TokenClass::COUNT], fitted: false }
	}
}

/// Everything learned about one category.
///
/// # Responsibilities
/// - Counting tokens into the feature table, the spool and the digram counts
/// - Per-document entropy statistics and the confidence reservoir
/// - Driving smoothing, fitting and saving
///
/// # Lifecycle
/// Created fresh with [`Learner::new`] or resumed from an online dump, fed with
/// [`Learner::learn`], optionally merged with other learners, then fitted and
/// saved with [`Learner::optimize_and_save`].
#[derive(Debug)]
pub struct Learner {
	name: String,
	pub(crate) options: ModelOptions,
	pub(crate) regexes: Vec<RegexSpec>,
	pub(crate) store: FeatureStore,
	pub(crate) spool: TokenSpool,
	/// Raw transition counts, never smoothed in place.
	pub(crate) counts: DigramTable,
	/// Smoothed reference table of the last fit.
	pub(crate) reference: Option<DigramTable>,
	pub(crate) stats: ModelStats,
	pub(crate) fit: FitSummary,
	pub(crate) entropy: EntropySummary,
	pub(crate) docs: DocumentStats,
	tally: DocumentTally,
	pub(crate) reservoir: Option<Reservoir>,
	pub(crate) warnings: Warnings,
	entropy_enabled: bool,
}

impl Learner {
	/// Creates an empty learner configured by `session`.
	///
	/// # Errors
	/// `Io` if the token spool cannot be created.
	pub fn new(session: &Session, name: &str) -> Result<Self> {
		let config = &session.config;
		let spool = TokenSpool::new(config.spool_dir.as_deref(), config.mmap_spool, config.save.lock_memory)?;
		let learner = Self::from_parts(session, name, config.model.clone(), FeatureStore::new(config.store), spool);
		debug!(model = name, hash_bits = learner.store.hash_bits(), "created learner");
		Ok(learner)
	}

	pub(crate) fn from_parts(
		session: &Session,
		name: &str,
		options: ModelOptions,
		store: FeatureStore,
		spool: TokenSpool,
	) -> Self {
		let entropy_enabled = options.document_entropy;
		let reservoir = (entropy_enabled && session.config.confidence).then(|| Reservoir::new(session.rng()));
		Self {
			name: name.replace('\n', " "),
			options,
			regexes: Vec::new(),
			store,
			spool,
			counts: DigramTable::new(),
			reference: None,
			stats: ModelStats::default(),
			fit: FitSummary::default(),
			entropy: EntropySummary::default(),
			docs: DocumentStats::default(),
			tally: DocumentTally::default(),
			reservoir,
			warnings: Warnings::default(),
			entropy_enabled,
		}
	}

	/// Records the regexes the tokenizer used, for the category header.
	pub fn with_regexes(mut self, regexes: Vec<RegexSpec>) -> Self {
		self.regexes = regexes;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn options(&self) -> &ModelOptions {
		&self.options
	}

	pub fn regexes(&self) -> &[RegexSpec] {
		&self.regexes
	}

	pub fn store(&self) -> &FeatureStore {
		&self.store
	}

	pub fn spool(&self) -> &TokenSpool {
		&self.spool
	}

	pub fn digram_counts(&self) -> &DigramTable {
		&self.counts
	}

	pub fn reference(&self) -> Option<&DigramTable> {
		self.reference.as_ref()
	}

	pub fn stats(&self) -> &ModelStats {
		&self.stats
	}

	pub fn fit_summary(&self) -> &FitSummary {
		&self.fit
	}

	pub fn entropy(&self) -> &EntropySummary {
		&self.entropy
	}

	pub fn document_stats(&self) -> &DocumentStats {
		&self.docs
	}

	pub fn reservoir(&self) -> Option<&Reservoir> {
		self.reservoir.as_ref()
	}

	pub fn unique_token_count(&self) -> usize {
		self.store.unique_count()
	}

	pub fn full_token_count(&self) -> u64 {
		self.stats.full_token_count
	}

	pub fn feature(&self, token: &Token) -> Option<&Feature> {
		self.store.get(token.id())
	}

	/// Warnings raised by this learner and its feature table.
	pub fn warnings(&self) -> Warnings {
		let mut all = self.warnings;
		all.absorb(self.store.warnings);
		all
	}

	/// Counts one token.
	///
	/// # Behavior
	/// - In multinomial mode every token is treated as order 1.
	/// - A feature seen for the first time has its text appended to the spool.
	/// - Order-1 tokens also feed the digram counts.
	/// - Tokens dropped by a full table are not counted.
	///
	/// # Errors
	/// `Io` if the spool cannot be written.
	pub fn learn(&mut self, token: &Token) -> Result<()> {
		let order = if self.options.multinomial { 1 } else { token.order() };
		let id = token.id();
		match self.store.insert_or_increment(id, order, token.class()) {
			Insert::Rejected => {
				self.tally.count_only();
				return Ok(());
			}
			Insert::New(_) => {
				self.spool.append(token)?;
				self.stats.unique_counts[order as usize] += 1;
				self.stats.max_order = self.stats.max_order.max(order);
			}
			Insert::Existing(_) => {}
		}

		let per_order = &mut self.stats.token_counts[order as usize];
		match (self.stats.full_token_count.checked_add(1), per_order.checked_add(1)) {
			(Some(full), Some(n)) => {
				self.stats.full_token_count = full;
				*per_order = n;
			}
			_ => {
				self.warnings.raise(&self.name, Warning::SkewedConstraints);
			}
		}

		if self.entropy_enabled {
			if !self.tally.record(id) {
				self.entropy_enabled = false;
				self.warnings.raise(&self.name, Warning::EntropyDisabled);
			}
		} else {
			self.tally.count_only();
		}

		if order == 1 && self.counts.observe(token.text()) {
			self.warnings.raise(&self.name, Warning::DigramOverflow);
		}
		Ok(())
	}

	/// Closes the current document and folds it into the document statistics.
	pub fn end_document(&mut self) {
		if self.tally.tokens() == 0 {
			self.docs.empty_count += 1;
			return;
		}
		self.docs.count += 1;
		let Some(sample) = self.tally.finish() else {
			return;
		};
		for &(id, share) in &sample.shares {
			if let Some(feature) = self.store.get_mut(id) {
				feature.doc_weight += share;
			}
		}
		self.docs.entropy_sum += sample.entropy;
		self.docs.entropy_sq_sum += sample.entropy * sample.entropy;
		if let Some(reservoir) = self.reservoir.as_mut() {
			reservoir.offer(sample);
		}
	}

	/// Folds every feature into order 1 when no unigram was ever seen.
	///
	/// # Returns
	/// `true` if the model was converted to multinomial.
	pub(crate) fn ensure_unigrams(&mut self) -> bool {
		if self.stats.token_counts[1] > 0 || self.store.unique_count() == 0 {
			return false;
		}
		self.warnings.raise(&self.name, Warning::NoUnigrams);
		self.options.multinomial = true;
		for feature in self.store.iter_mut() {
			feature.order = 1;
		}
		let full = self.stats.full_token_count;
		let unique = self.store.unique_count() as u64;
		self.stats.token_counts = Default::default();
		self.stats.unique_counts = Default::default();
		self.stats.token_counts[1] = full;
		self.stats.unique_counts[1] = unique;
		self.stats.max_order = 1;
		true
	}

	/// Seeds the weights from a previously saved version of this category.
	///
	/// Only used when the options match, the old model is not skewed and the
	/// number of features is within 15%.
	///
	/// # Returns
	/// `true` if any weight was copied.
	pub fn prefill_from(&mut self, category: &Category) -> bool {
		let header = category.header();
		let unique = self.store.unique_count() as f64;
		let close = unique > 0.0 && ((header.unique_token_count as f64 - unique) / unique).abs() < PREFILL_TOLERANCE;
		if header.options != self.options || header.skewed || !close {
			debug!(model = %self.name, "previous weights not reusable");
			return false;
		}
		let mut copied = 0usize;
		for feature in self.store.iter_mut() {
			if let Some(lambda) = category.weight(feature.id) {
				feature.lambda = lambda;
				copied += 1;
			}
		}
		debug!(model = %self.name, copied, "prefilled weights");
		copied > 0
	}

	/// Smooths the digram counts into the reference table.
	pub(crate) fn smooth(&mut self, tolerances: &Tolerances) -> Result<()> {
		let mut reference = self.counts.clone();
		reference.smooth(self.options.smoothing, tolerances, self.options.encoding, &mut self.warnings)?;
		self.reference = Some(reference);
		Ok(())
	}

	/// Smooths, fits and computes the entropy statistics.
	///
	/// # Errors
	/// `NumericalBlowup` or `Interrupted` from the fitter.
	pub fn optimize(&mut self, session: &Session, tolerances: &Tolerances) -> Result<()> {
		self.ensure_unigrams();
		self.smooth(tolerances)?;
		MaxEntFitter::new(session, *tolerances).fit(self)?;
		self.calc_entropy();
		Ok(())
	}

	/// Full end of a learning run.
	///
	/// # Behavior
	/// 1. Writes the online dump if one is configured.
	/// 2. Reuses the weights of the existing category if enabled.
	/// 3. Optimizes.
	/// 4. Tries the in-place update if enabled, then falls back to a full
	///    atomic save.
	///
	/// # Errors
	/// Any error from the steps above. A failed in-place update that already
	/// touched the file is returned as is; the file must be considered lost.
	pub fn optimize_and_save<P: AsRef<Path>>(&mut self, session: &Session, path: P) -> Result<()> {
		let path = path.as_ref();
		let config = &session.config;
		if let Some(dump) = &config.online_dump {
			self.write_online_dump(dump)?;
		}

		let mut tolerances = config.tolerances;
		if config.prefill_lambdas && path.exists() {
			match Category::open(path, config.save.mmap) {
				Ok(previous) => {
					if self.prefill_from(&previous) {
						let tight = Tolerances::quality(2);
						tolerances.lambda = tolerances.lambda.min(tight.lambda);
						tolerances.log_z = tolerances.log_z.min(tight.log_z);
					}
				}
				Err(e) => debug!(model = %self.name, "cannot reuse previous weights: {}", e),
			}
		}

		self.optimize(session, &tolerances)?;

		if config.save.fast_partial && path.exists() {
			match self.fast_partial_save(path, &config.save)? {
				PartialSave::Written => {
					info!(model = %self.name, path = %path.display(), "updated category in place");
					return Ok(());
				}
				PartialSave::Unavailable(reason) => debug!(model = %self.name, "in-place update skipped: {}", reason),
			}
		}
		self.save_category(path, &config.save)
	}

	/// Entropy of the training documents and, when a reservoir is kept,
	/// the confidence parameters of the fitted model.
	pub(crate) fn calc_entropy(&mut self) {
		let mut summary = EntropySummary::default();
		if self.options.document_entropy && self.docs.count > 1 {
			summary.shannon = self.docs.mean_entropy();
			summary.shannon2 = self.docs.entropy_variance();
		} else {
			let top = self.stats.max_order;
			let (mut n, mut sum) = (0.0, 0.0);
			for feature in self.store.iter().filter(|f| f.order == top) {
				let c = feature.count as f64;
				n += c;
				sum += c * c.ln();
			}
			if n > 0.0 {
				summary.shannon = n.ln() - sum / n;
			}
		}

		if let Some(reservoir) = self.reservoir.as_ref() {
			if self.docs.count > 0 && reservoir.samples().len() > 1 {
				let log_z = self.fit.log_z;
				let weight = |f: &Feature| f.lambda + if f.order == 1 { f.right - log_z } else { 0.0 };
				let n = self.docs.count as f64;
				let mean_score = self.store.iter().map(|f| weight(f) * f.doc_weight).sum::<f64>() / n;
				let mu = -(summary.shannon + mean_score);
				let mut s2 = 0.0;
				for sample in reservoir.samples() {
					let score: f64 = sample
						.shares
						.iter()
						.filter_map(|&(id, share)| self.store.get(id).map(|f| weight(f) * share))
						.sum::<f64>() + sample.entropy;
					let deviation = -score - mu;
					s2 += deviation * deviation;
				}
				s2 /= (reservoir.samples().len() - 1) as f64;
				summary.mu = mu;
				summary.s2 = s2;
				if s2 > 0.0 && mu != 0.0 {
					summary.alpha = mu * mu / s2;
					summary.beta = s2 / mu;
				}
			}
		}
		self.entropy = summary;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SessionConfig;

	fn words(learner: &mut Learner, text: &str) {
		for w in text.split_whitespace() {
			learner.learn(&Token::unigram(w.as_bytes(), TokenClass::Text).unwrap()).unwrap();
		}
		learner.end_document();
	}

	#[test]
	fn free_money_counts() {
		let session = Session::default();
		let mut learner = Learner::new(&session, "spam").unwrap();
		words(&mut learner, "free money free offer");
		assert_eq!(learner.unique_token_count(), 3);
		assert_eq!(learner.full_token_count(), 4);
		let free = Token::unigram(b"free", TokenClass::Text).unwrap();
		assert_eq!(learner.feature(&free).map(|f| f.count), Some(2));
		assert_eq!(learner.stats().max_order, 1);
		assert_eq!(learner.document_stats().count, 1);
	}

	#[test]
	fn spool_holds_each_feature_once() {
		let session = Session::default();
		let mut learner = Learner::new(&session, "spam").unwrap();
		words(&mut learner, "free money free offer money");
		let mut seen = Vec::new();
		learner
			.spool()
			.for_each(|t| {
				seen.push(t.to_string());
				Ok(())
			})
			.unwrap();
		assert_eq!(seen, vec!["free", "money", "offer"]);
	}

	#[test]
	fn higher_orders_skip_digrams() {
		let session = Session::default();
		let mut learner = Learner::new(&session, "x").unwrap();
		learner.learn(&Token::from_subtokens(&["a", "b"], TokenClass::Text).unwrap()).unwrap();
		assert_eq!(learner.stats().max_order, 2);
		assert_eq!(learner.stats().token_counts[2], 1);
		assert!(learner.digram_counts().cells().iter().all(|&c| c == 0.0));
	}

	#[test]
	fn no_unigrams_falls_back_to_multinomial() {
		let session = Session::default();
		let mut learner = Learner::new(&session, "x").unwrap();
		learner.learn(&Token::from_subtokens(&["a", "b"], TokenClass::Text).unwrap()).unwrap();
		learner.learn(&Token::from_subtokens(&["b", "c"], TokenClass::Text).unwrap()).unwrap();
		assert!(learner.ensure_unigrams());
		assert!(learner.options().multinomial);
		assert_eq!(learner.stats().token_counts[1], 2);
		assert!(learner.store().iter().all(|f| f.order == 1));
		assert!(learner.warnings().is_raised(Warning::NoUnigrams));
	}

	#[test]
	fn document_entropy_is_tracked() {
		let mut config = SessionConfig::default();
		config.model.document_entropy = true;
		config.confidence = true;
		config.seed = Some(3);
		let session = Session::new(config);
		let mut learner = Learner::new(&session, "x").unwrap();
		words(&mut learner, "a b");
		words(&mut learner, "a a a a");
		learner.end_document();
		let docs = learner.document_stats();
		assert_eq!(docs.count, 2);
		assert_eq!(docs.empty_count, 1);
		assert!((docs.entropy_sum - 2f64.ln()).abs() < 1e-12);
		assert_eq!(learner.reservoir().map(|r| r.samples().len()), Some(2));
		let a = Token::unigram(b"a", TokenClass::Text).unwrap();
		assert!((learner.feature(&a).unwrap().doc_weight - 1.5).abs() < 1e-12);
	}
}
