use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use super::feature_store::Insert;
use super::learner::{FitSummary, Learner};
use crate::error::{MaxcatError, Result, Warning};
use crate::session::Session;
use crate::token::MAX_ORDER;

impl Learner {
	/// Adds everything `other` has learned to this learner.
	///
	/// # Behavior
	/// 1. Refuses learners whose tokenizer used other regexes.
	/// 2. Adds counts feature by feature, growing the table as needed.
	/// 3. Appends the spooled text of every feature new to this learner.
	/// 4. Adds the token totals, digram counts and document statistics of
	///    the features that were kept.
	///
	/// Features a full table rejects are dropped entirely, exactly as when
	/// learning them directly. All weights and fitted constants are then
	/// cleared; the merged learner must be optimized again before it is saved.
	///
	/// # Errors
	/// - `RegexMismatch` if the regex configurations differ
	/// - `Io` or `Corrupt` from the spools
	pub fn merge(&mut self, other: &Learner) -> Result<()> {
		if self.regexes != other.regexes {
			return Err(MaxcatError::RegexMismatch);
		}

		let multinomial = self.options.multinomial;
		let fold = |order: u8| if multinomial { 1 } else { order };
		let mut added = HashSet::new();
		let mut rejected = HashSet::new();
		let mut totals = [0u64; MAX_ORDER as usize + 1];
		for feature in other.store.iter() {
			let order = fold(feature.order);
			match self.store.claim(feature.id, order, feature.class) {
				Insert::New(index) => {
					self.store.add_count(index, feature.count);
					self.stats.unique_counts[order as usize] += 1;
					self.stats.max_order = self.stats.max_order.max(order);
					if let Some(merged) = self.store.feature_mut(index) {
						merged.doc_weight = feature.doc_weight;
					}
					added.insert(feature.id);
				}
				Insert::Existing(index) => {
					self.store.add_count(index, feature.count);
					if let Some(merged) = self.store.feature_mut(index) {
						merged.doc_weight += feature.doc_weight;
					}
				}
				Insert::Rejected => {
					rejected.insert(feature.id);
					continue;
				}
			}
			totals[order as usize] += u64::from(feature.count);
		}

		let name = self.name().to_owned();
		let spool = &mut self.spool;
		let counts = &mut self.counts;
		let mut digram_overflow = false;
		if rejected.is_empty() {
			digram_overflow = counts.add_counts(&other.counts);
		}
		other.spool.for_each(|token| {
			if added.contains(&token.id()) {
				spool.append(&token)?;
			}
			if !rejected.is_empty() && !rejected.contains(&token.id()) {
				if let Some(feature) = other.store.get(token.id()).filter(|f| fold(f.order) == 1) {
					digram_overflow |= counts.observe_times(token.text(), f64::from(feature.count));
				}
			}
			Ok(())
		})?;
		if digram_overflow {
			self.warnings.raise(&name, Warning::DigramOverflow);
		}

		let mut skewed = false;
		for (order, n) in totals.into_iter().enumerate() {
			let total = &mut self.stats.token_counts[order];
			*total = total.checked_add(n).unwrap_or_else(|| {
				skewed = true;
				u64::MAX
			});
			self.stats.full_token_count = self.stats.full_token_count.checked_add(n).unwrap_or_else(|| {
				skewed = true;
				u64::MAX
			});
		}
		if skewed {
			self.warnings.raise(&name, Warning::SkewedConstraints);
		}
		self.docs.add(&other.docs);
		self.warnings.absorb(other.warnings());

		self.store.reset_weights();
		self.fit = FitSummary::default();
		self.reference = None;
		self.entropy.clear_confidence();
		info!(
			model = %name,
			from = %other.name(),
			features = self.store.unique_count(),
			dropped = rejected.len(),
			"merged learner"
		);
		Ok(())
	}

	/// Merges the learner saved in an online dump.
	pub fn merge_dump<P: AsRef<Path>>(&mut self, session: &Session, path: P) -> Result<()> {
		let other = Learner::resume(session, path)?;
		self.merge(&other)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::config::SessionConfig;
	use crate::model::digram::ROW_TOKLEN;
	use crate::model::learner::RegexSpec;
	use crate::token::{Token, TokenClass};

	fn learner(session: &Session, docs: &[&str]) -> Learner {
		let mut learner = Learner::new(session, "x").unwrap();
		for doc in docs {
			let words: Vec<&str> = doc.split_whitespace().collect();
			for w in &words {
				learner.learn(&Token::unigram(w.as_bytes(), TokenClass::Text).unwrap()).unwrap();
			}
			for pair in words.windows(2) {
				learner.learn(&Token::from_subtokens(pair, TokenClass::Text).unwrap()).unwrap();
			}
			learner.end_document();
		}
		learner
	}

	fn counts(learner: &Learner) -> BTreeMap<u64, (u32, u8)> {
		learner.store().iter().map(|f| (f.id, (f.count, f.order))).collect()
	}

	fn spooled(learner: &Learner) -> Vec<String> {
		let mut seen = Vec::new();
		learner
			.spool()
			.for_each(|t| {
				seen.push(t.to_string());
				Ok(())
			})
			.unwrap();
		seen.sort();
		seen
	}

	#[test]
	fn merge_is_commutative() {
		let session = Session::default();
		let left = ["the cat sat", "the dog ran"];
		let right = ["a cat ran", "the end"];

		let mut ab = learner(&session, &left);
		ab.merge(&learner(&session, &right)).unwrap();
		let mut ba = learner(&session, &right);
		ba.merge(&learner(&session, &left)).unwrap();

		assert_eq!(counts(&ab), counts(&ba));
		assert_eq!(ab.stats(), ba.stats());
		assert_eq!(ab.digram_counts(), ba.digram_counts());
		assert_eq!(ab.document_stats().count, 4);
		assert_eq!(spooled(&ab), spooled(&ba));
		assert_eq!(spooled(&ab).len(), ab.unique_token_count());
	}

	#[test]
	fn merge_matches_learning_everything() {
		let session = Session::default();
		let mut merged = learner(&session, &["free money"]);
		merged.merge(&learner(&session, &["free offer"])).unwrap();
		let direct = learner(&session, &["free money", "free offer"]);
		assert_eq!(counts(&merged), counts(&direct));
		assert_eq!(merged.stats(), direct.stats());
	}

	#[test]
	fn merge_clears_the_fit() {
		let session = Session::default();
		let mut a = learner(&session, &["some words here"]);
		let tolerances = session.config.tolerances;
		a.optimize(&session, &tolerances).unwrap();
		assert!(a.fit_summary().fitted);
		a.merge(&learner(&session, &["more words"])).unwrap();
		assert!(!a.fit_summary().fitted);
		assert!(a.reference().is_none());
		assert!(a.store().iter().all(|f| f.lambda == 0.0));
	}

	#[test]
	fn regex_mismatch_is_refused() {
		let session = Session::default();
		let mut a = learner(&session, &["x"]);
		let b = learner(&session, &["y"]).with_regexes(vec![RegexSpec { pattern: "[a-z]+".to_owned(), submatches: "0".to_owned() }]);
		assert!(matches!(a.merge(&b), Err(MaxcatError::RegexMismatch)));
		assert_eq!(a.unique_token_count(), 1);
	}

	#[test]
	fn full_table_keeps_counts_of_kept_features_only() {
		let mut config = SessionConfig::default();
		config.store.hash_bits = 2;
		config.store.growable = false;
		let session = Session::new(config);
		let direct = learner(&session, &["a", "b", "c", "d", "e", "f"]);
		let mut merged = learner(&session, &["a", "b", "c"]);
		merged.merge(&learner(&session, &["d", "e", "f"])).unwrap();

		for model in [&direct, &merged] {
			let stored: u64 = model.store().iter().map(|f| u64::from(f.count)).sum();
			assert_eq!(model.unique_token_count(), 4);
			assert_eq!(model.full_token_count(), stored);
			assert_eq!(model.stats().token_counts[1], stored);
			assert_eq!(spooled(model).len(), 4);
		}
		assert_eq!(merged.stats(), direct.stats());
		let lengths = |l: &Learner| l.digram_counts().row(ROW_TOKLEN).iter().sum::<f64>();
		assert_eq!(lengths(&merged), 4.0);
		assert_eq!(lengths(&direct), 4.0);
	}
}
