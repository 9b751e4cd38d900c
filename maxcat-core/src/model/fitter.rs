use tracing::debug;

use super::digram::DigramTable;
use super::feature_store::{FeatureStore, Probe};
use super::learner::Learner;
use crate::config::Tolerances;
use crate::error::{MaxcatError, Result};
use crate::session::Session;
use crate::token::TokenClass;

/// Iteration cap of the per-order fit.
pub const MAX_ITERATIONS: usize = 50;
/// Iteration cap of the outer multipass loop.
pub const MAX_PASSES: usize = 50;
/// Relative partition change under which multipass stops.
const MULTIPASS_TOLERANCE: f64 = 0.01;

/// Reference-measure quantities shared by all features of one order.
#[derive(Debug, Clone, Copy)]
struct ReferenceMeasure {
	/// Log of the partition mass that does not depend on this order's weights.
	log_unchanged: f64,
	/// Reference mass covered by this order's features.
	kappa: f64,
}

/// Iterative scaling of the feature weights of a learner.
///
/// # Behavior
/// For each order `r`, every feature `f` with count `c` gets
/// `λ = (ln c − ln Ξ_r − R_f) / r + logZ_r − L_f`, where `Ξ_r` is the number
/// of order-`r` tokens, `R_f` the digramic excursion of the token and `L_f`
/// the sum of the weights of its proper suffixes. The step is clipped to
/// `max_lambda_jump` and the result floored at zero.
///
/// # Notes
/// The partition function is evaluated with a max-then-log-sum-exp over the
/// features, alternating the traversal direction between evaluations.
pub struct MaxEntFitter<'a> {
	session: &'a Session,
	tolerances: Tolerances,
}

impl<'a> MaxEntFitter<'a> {
	pub fn new(session: &'a Session, tolerances: Tolerances) -> Self {
		Self { session, tolerances }
	}

	/// Fits every order of `learner`.
	///
	/// # Errors
	/// - `NotFitted` if the learner has no smoothed reference table
	/// - `NumericalBlowup` if a partition function stops being finite
	/// - `Interrupted` if the session was interrupted; weights are then
	///   partially updated and must not be saved
	pub fn fit(&self, learner: &mut Learner) -> Result<()> {
		let Some(reference) = learner.reference.take() else {
			return Err(MaxcatError::NotFitted(learner.name().to_owned()));
		};
		let result = self.fit_with(learner, &reference);
		learner.reference = Some(reference);
		result
	}

	fn fit_with(&self, learner: &mut Learner, reference: &DigramTable) -> Result<()> {
		let multinomial = learner.options.multinomial;
		let max_order = if multinomial { 1 } else { learner.stats.max_order.max(1) };
		learner.fit.log_z = 0.0;
		learner.fit.divergence = 0.0;
		learner.fit.fitted = false;

		if learner.options.reference_only {
			for order in 1..=max_order {
				self.recalculate_reference(learner, reference, order)?;
			}
		} else {
			let passes = if self.tolerances.multipass && !multinomial && max_order > 1 { MAX_PASSES } else { 1 };
			let mut previous_log_z = 0.0;
			for pass in 0..passes {
				for order in 1..=max_order {
					self.fit_order(learner, reference, order)?;
				}
				let log_z = learner.fit.log_z;
				debug!(model = learner.name(), pass, log_z, "fit pass complete");
				if pass > 0 && log_z != 0.0 && (1.0 - previous_log_z / log_z).abs() < MULTIPASS_TOLERANCE {
					break;
				}
				previous_log_z = log_z;
			}
		}

		learner.fit.media_probs = media_probs(&learner.store, max_order);
		learner.fit.fitted = true;
		Ok(())
	}

	/// Replays the spool to refresh `R_f` and `L_f` of the order-`order`
	/// features and to sum the lower-order contributions.
	fn recalculate_reference(&self, learner: &mut Learner, reference: &DigramTable, order: u8) -> Result<ReferenceMeasure> {
		let multinomial = learner.options.multinomial;
		let scale = order as f64;
		let store = &mut learner.store;
		let mut lower: Vec<(f64, f64)> = Vec::new();
		let mut max = 0.0f64;
		let mut kappa = 0.0;

		learner.spool.for_each(|token| {
			let token_order = if multinomial { 1 } else { token.order() };
			if token_order > order {
				return Ok(());
			}
			let Probe::Found(index) = store.find(token.id()) else {
				return Ok(());
			};
			let Some(feature) = store.feature(index) else {
				return Ok(());
			};
			if feature.order != token_order {
				return Ok(());
			}
			if token_order == order {
				let right = reference.excursion(token.text());
				let left = if multinomial {
					0.0
				} else {
					token.suffix_ids().filter_map(|id| store.get(id)).map(|s| s.lambda).sum()
				};
				if let Some(feature) = store.feature_mut(index) {
					feature.right = right;
					feature.left = left;
				}
				kappa += right.exp();
			} else if feature.lambda != 0.0 {
				let base = scale * feature.left + feature.right;
				let full = scale * feature.lambda + base;
				max = max.max(full);
				lower.push((full, base));
			}
			Ok(())
		})?;

		let mut mass = (-max).exp();
		for (full, base) in lower {
			mass += (full - max).exp() - (base - max).exp();
		}
		Ok(ReferenceMeasure { log_unchanged: max + mass.ln(), kappa })
	}

	fn fit_order(&self, learner: &mut Learner, reference: &DigramTable, order: u8) -> Result<()> {
		let xi = learner.stats.token_counts[order as usize] as f64;
		if xi <= 0.0 {
			return Ok(());
		}
		let measure = self.recalculate_reference(learner, reference, order)?;
		let scale = order as f64;
		let log_xi = xi.ln();
		let min_count = learner.options.min_count;
		let encoding = learner.options.encoding;
		let jump = self.tolerances.max_lambda_jump;
		let store = &mut learner.store;

		let lower_bits: f64 = store.iter().filter(|f| f.order < order).map(|f| f.lambda * f.count as f64).sum::<f64>() / xi;

		let mut forward = true;
		let mut log_z = log_partition(store, order, measure.log_unchanged, forward)?;
		let mut divergence = order_divergence(store, order, log_z, xi);
		let mut iterations = 0;

		while iterations < MAX_ITERATIONS {
			self.session.check_interrupt()?;
			iterations += 1;
			let mut max_delta = 0.0f64;
			for feature in store.iter_mut().filter(|f| f.order == order) {
				let old = feature.lambda;
				let mut next = if feature.count <= min_count {
					0.0
				} else {
					((feature.count as f64).ln() - log_xi - feature.right) / scale + log_z - feature.left
				};
				if next.is_nan() {
					next = old;
				}
				next = encoding.quantize(next.clamp(old - jump, old + jump).max(0.0));
				max_delta = max_delta.max((next - old).abs());
				feature.lambda = next;
			}

			forward = !forward;
			let next_log_z = log_partition(store, order, measure.log_unchanged, forward)?;
			let next_divergence = order_divergence(store, order, next_log_z, xi);
			let settled = (next_divergence - divergence).abs() <= self.tolerances.divergence
				&& max_delta <= self.tolerances.lambda
				&& (next_log_z - log_z).abs() <= self.tolerances.log_z;
			log_z = next_log_z;
			divergence = next_divergence;
			if settled {
				break;
			}
		}

		learner.fit.log_z = log_z;
		learner.fit.divergence = divergence + lower_bits;
		debug!(
			model = learner.name(),
			order,
			iterations,
			log_z,
			divergence = learner.fit.divergence,
			reference_mass = measure.kappa,
			"fitted order"
		);
		Ok(())
	}
}

/// `logZ_r`, two passes: the maximum exponent, then the shifted sum.
fn log_partition(store: &FeatureStore, order: u8, log_unchanged: f64, forward: bool) -> Result<f64> {
	let scale = order as f64;
	let mut max = log_unchanged;
	for f in store.ordered(forward).filter(|f| f.order == order) {
		max = max.max(scale * (f.lambda + f.left) + f.right);
	}
	let mut total = (log_unchanged - max).exp();
	for f in store.ordered(forward).filter(|f| f.order == order) {
		let base = scale * f.left + f.right;
		total += (scale * f.lambda + base - max).exp() - (base - max).exp();
	}
	let log_z = (max + total.ln()) / scale;
	if log_z.is_finite() { Ok(log_z) } else { Err(MaxcatError::NumericalBlowup { order }) }
}

fn order_divergence(store: &FeatureStore, order: u8, log_z: f64, xi: f64) -> f64 {
	-log_z + store.iter().filter(|f| f.order == order).map(|f| f.lambda * f.count as f64 / xi).sum::<f64>()
}

/// Probability of each token class under the fitted weights, starting from
/// a uniform prior and normalized to sum to one.
fn media_probs(store: &FeatureStore, max_order: u8) -> [f64; TokenClass::COUNT] {
	let scale = max_order as f64;
	let terms: Vec<(usize, f64, f64)> = store
		.iter()
		.filter(|f| f.lambda != 0.0)
		.map(|f| {
			let base = scale * f.left + f.right;
			(f.class.index(), scale * f.lambda + base, base)
		})
		.collect();
	let shift = terms.iter().map(|t| t.1).fold(0.0f64, f64::max);
	let mut probs = [(-shift).exp() / TokenClass::COUNT as f64; TokenClass::COUNT];
	for (class, full, base) in terms {
		probs[class] += (full - shift).exp() - (base - shift).exp();
	}
	let total: f64 = probs.iter().sum();
	if total > 0.0 && total.is_finite() {
		for p in probs.iter_mut() {
			*p /= total;
		}
	} else {
		probs = [1.0 / TokenClass::COUNT as f64; TokenClass::COUNT];
	}
	probs
}
