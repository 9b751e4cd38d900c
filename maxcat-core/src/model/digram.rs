use crate::config::{Smoothing, Tolerances};
use crate::error::{MaxcatError, Result, Warning, Warnings};
use crate::token::DIAMOND;
use crate::weight::WeightEncoding;

/// Rows and columns of the table.
pub const ASIZE: usize = 256;
/// First byte of the alphabet, bytes below it are clipped up.
pub const AMIN: usize = DIAMOND as usize;
/// Row holding destination-only character counts.
pub const ROW_MARGINAL: usize = 0;
/// Row holding the token length histogram.
pub const ROW_TOKLEN: usize = 1;
/// Longest token length tracked, longer tokens share the last bin.
pub const MAX_TOKEN_LEN: usize = 30;
/// Saturation point of a digram count.
pub const DIGRAM_COUNT_MAX: f64 = u32::MAX as f64;

const MAX_DIRICHLET_ITERATIONS: usize = 300;
const MAX_MAXENT_ITERATIONS: usize = 500;
const DIRICHLET_U_MIN: f64 = 1e-10;
const DIRICHLET_U_MAX: f64 = 1e6;

/// Size of the alphabet.
pub fn alphabet_size() -> f64 {
	(ASIZE - AMIN) as f64
}

fn clip(byte: u8) -> usize {
	(byte as usize).max(AMIN)
}

/// Character transition table.
///
/// Holds raw counts while learning and log-probabilities once smoothed.
/// Row `p`, column `q` is the transition from byte `p` to byte `q`.
#[derive(Debug, Clone, PartialEq)]
pub struct DigramTable {
	cells: Vec<f64>,
}

impl Default for DigramTable {
	fn default() -> Self {
		Self::new()
	}
}

impl DigramTable {
	pub fn new() -> Self {
		Self { cells: vec![0.0; ASIZE * ASIZE] }
	}

	/// Wraps `ASIZE * ASIZE` cells in row-major order.
	pub fn from_cells(cells: Vec<f64>) -> Option<Self> {
		(cells.len() == ASIZE * ASIZE).then_some(Self { cells })
	}

	pub fn cells(&self) -> &[f64] {
		&self.cells
	}

	pub fn get(&self, p: usize, q: usize) -> f64 {
		self.cells[p * ASIZE + q]
	}

	pub fn row(&self, p: usize) -> &[f64] {
		&self.cells[p * ASIZE..(p + 1) * ASIZE]
	}

	fn row_mut(&mut self, p: usize) -> &mut [f64] {
		&mut self.cells[p * ASIZE..(p + 1) * ASIZE]
	}

	/// Adds `by` to a count, returning `true` if it saturated.
	fn bump(&mut self, p: usize, q: usize, by: f64) -> bool {
		let cell = &mut self.cells[p * ASIZE + q];
		let sum = *cell + by;
		*cell = sum.min(DIGRAM_COUNT_MAX);
		sum > DIGRAM_COUNT_MAX
	}

	/// Counts the transitions of an order-1 token.
	///
	/// # Behavior
	/// - Every transition `p -> q` bumps `dig[p][q]` and the marginal `dig[0][q]`.
	/// - The length (non-separator bytes plus one) bumps the length histogram.
	///
	/// # Returns
	/// `true` if any count saturated.
	pub fn observe(&mut self, text: &[u8]) -> bool {
		self.observe_times(text, 1.0)
	}

	/// Counts the transitions of a token seen `times` times.
	pub fn observe_times(&mut self, text: &[u8], times: f64) -> bool {
		let Some((&first, rest)) = text.split_first() else {
			return false;
		};
		let mut saturated = false;
		let mut p = clip(first);
		let mut len = 1;
		for &byte in rest {
			let q = clip(byte);
			saturated |= self.bump(p, q, times);
			saturated |= self.bump(ROW_MARGINAL, q, times);
			if byte != DIAMOND {
				len += 1;
			}
			p = q;
		}
		saturated |= self.bump(ROW_TOKLEN, len.min(MAX_TOKEN_LEN + 1), times);
		saturated
	}

	/// Log-probability of `text` under the smoothed table.
	///
	/// Sum of the transition log-probabilities plus the length term
	/// `dig[1][len] - dig[1][0]`.
	pub fn excursion(&self, text: &[u8]) -> f64 {
		let Some((&first, rest)) = text.split_first() else {
			return 0.0;
		};
		let mut total = 0.0;
		let mut p = clip(first);
		let mut len = 1;
		for &byte in rest {
			let q = clip(byte);
			total += self.get(p, q);
			if byte != DIAMOND {
				len += 1;
			}
			p = q;
		}
		total + self.get(ROW_TOKLEN, len.min(MAX_TOKEN_LEN + 1)) - self.get(ROW_TOKLEN, 0)
	}

	/// Adds another table of counts elementwise, saturating.
	///
	/// # Returns
	/// `true` if any cell saturated.
	pub fn add_counts(&mut self, other: &DigramTable) -> bool {
		let mut saturated = false;
		for (cell, add) in self.cells.iter_mut().zip(&other.cells) {
			let sum = *cell + add;
			saturated |= sum > DIGRAM_COUNT_MAX;
			*cell = sum.min(DIGRAM_COUNT_MAX);
		}
		saturated
	}

	/// Replaces counts with smoothed log-probabilities.
	///
	/// # Behavior
	/// - Rows `AMIN..ASIZE` become distributions over columns `AMIN..ASIZE`,
	///   or all zero under `toklen`.
	/// - The marginal row is cleared; the length row is cleared except under
	///   `toklen`, where it holds the length log-probabilities.
	/// - Every cell is rounded through `encoding`.
	///
	/// # Errors
	/// `NumericalBlowup` if the `maxent` row fit produces a NaN partition function.
	pub fn smooth(
		&mut self,
		smoothing: Smoothing,
		tolerances: &Tolerances,
		encoding: WeightEncoding,
		warnings: &mut Warnings,
	) -> Result<()> {
		match smoothing {
			Smoothing::Uniform => self.smooth_uniform(),
			Smoothing::Dirichlet => self.smooth_dirichlet(tolerances.alpha, warnings),
			Smoothing::MaxEnt => self.smooth_maxent(tolerances)?,
			Smoothing::Mle => self.smooth_mle(),
			Smoothing::Iid => self.smooth_iid(),
			Smoothing::TokLen => self.smooth_toklen(),
		}
		self.clear_reserved(smoothing == Smoothing::TokLen);
		for cell in self.cells.iter_mut() {
			*cell = encoding.quantize(*cell);
		}
		Ok(())
	}

	fn clear_reserved(&mut self, keep_toklen: bool) {
		self.row_mut(ROW_MARGINAL).fill(0.0);
		if !keep_toklen {
			self.row_mut(ROW_TOKLEN).fill(0.0);
		}
		for p in AMIN..ASIZE {
			self.row_mut(p)[..AMIN].fill(0.0);
		}
	}

	fn fill_uniform(row: &mut [f64]) {
		row[AMIN..].fill(-alphabet_size().ln());
	}

	fn smooth_uniform(&mut self) {
		for p in AMIN..ASIZE {
			Self::fill_uniform(self.row_mut(p));
		}
	}

	/// Row frequencies mixed with a floor of `1/(t+1)` spread over the
	/// zero-count columns. Empty rows become uniform.
	fn mle_row(row: &mut [f64]) {
		let counts = &row[AMIN..];
		let total: f64 = counts.iter().sum();
		if total <= 0.0 {
			Self::fill_uniform(row);
			return;
		}
		let missing = counts.iter().filter(|&&c| c <= 0.0).count() as f64;
		let epsilon = if missing > 0.0 { 1.0 / (total + 1.0) } else { 0.0 };
		for cell in row[AMIN..].iter_mut() {
			*cell = if *cell > 0.0 { ((1.0 - epsilon) * *cell / total).ln() } else { (epsilon / missing).ln() };
		}
	}

	fn smooth_mle(&mut self) {
		for p in AMIN..ASIZE {
			Self::mle_row(self.row_mut(p));
		}
	}

	fn smooth_iid(&mut self) {
		let mut marginal = self.row(ROW_MARGINAL).to_vec();
		Self::mle_row(&mut marginal);
		for p in AMIN..ASIZE {
			self.row_mut(p)[AMIN..].copy_from_slice(&marginal[AMIN..]);
		}
	}

	/// Token length model: transitions carry no information.
	///
	/// # Behavior
	/// - Alphabet rows are zeroed.
	/// - Length bin `i` in `2..=31` holds `ln(h_i / Σh) - i ln A`, with empty
	///   bins counted once. Bin 0 is the normalizer and stays 0.
	///
	/// # Notes
	/// The length counts transitions of the token text, so the `-i ln A` term
	/// matches the uniform cost of a token of that length.
	fn smooth_toklen(&mut self) {
		for p in AMIN..ASIZE {
			self.row_mut(p)[AMIN..].fill(0.0);
		}
		let bins = 2..=MAX_TOKEN_LEN + 1;
		let histogram: Vec<f64> = bins.clone().map(|i| self.get(ROW_TOKLEN, i).max(1.0)).collect();
		let total: f64 = histogram.iter().sum();
		let log_a = alphabet_size().ln();
		let mut lengths = vec![0.0; ASIZE];
		for (i, h) in bins.zip(histogram) {
			lengths[i] = (h / total).ln() - i as f64 * log_a;
		}
		self.row_mut(ROW_TOKLEN).copy_from_slice(&lengths);
	}

	/// MacKay-Peto hierarchical Dirichlet smoothing.
	///
	/// # Behavior
	/// Iterates the fixed point
	/// `u_j = 2 V_j / (K(α) - G_j + sqrt((K(α) - G_j)^2 + 4 H_j V_j))`, with
	/// `α = Σ u_j`, until α moves by at most `tolerance` or the iteration cap is
	/// reached. Probabilities are `(c_ij + u_j) / (t_i + α)`.
	///
	/// # Notes
	/// `u_j` is kept within fixed bounds so unseen destinations keep a
	/// non-zero probability.
	fn smooth_dirichlet(&mut self, tolerance: f64, warnings: &mut Warnings) {
		let width = ASIZE - AMIN;
		let mut v = vec![0.0; width];
		let mut g = vec![0.0; width];
		let mut h = vec![0.0; width];
		let mut row_totals = Vec::with_capacity(width);
		for p in AMIN..ASIZE {
			let row = &self.row(p)[AMIN..];
			row_totals.push(row.iter().sum::<f64>());
			for (j, &c) in row.iter().enumerate() {
				if c >= 1.0 {
					v[j] += 1.0;
				}
				for k in 1..(c as u64) {
					let k = k as f64;
					g[j] += 1.0 / k;
					h[j] += 1.0 / (k * k);
				}
			}
		}
		if row_totals.iter().all(|&t| t <= 0.0) {
			self.smooth_uniform();
			return;
		}

		let mut u = vec![1.0 / width as f64; width];
		let mut alpha = 1.0;
		let mut converged = false;
		for _ in 0..MAX_DIRICHLET_ITERATIONS {
			let k_alpha: f64 = row_totals
				.iter()
				.filter(|&&f| f > 0.0)
				.map(|&f| ((f + alpha) / alpha).ln() + 0.5 * f / (alpha * (f + alpha)))
				.sum();
			for j in 0..width {
				u[j] = if v[j] > 0.0 {
					let d = k_alpha - g[j];
					let denominator = d + (d * d + 4.0 * h[j] * v[j]).sqrt();
					if denominator > 0.0 { 2.0 * v[j] / denominator } else { DIRICHLET_U_MAX }
				} else {
					DIRICHLET_U_MIN
				};
				u[j] = u[j].clamp(DIRICHLET_U_MIN, DIRICHLET_U_MAX);
			}
			let next: f64 = u.iter().sum();
			let delta = (next - alpha).abs();
			alpha = next;
			if delta <= tolerance {
				converged = true;
				break;
			}
		}
		if !converged {
			warnings.raise("digrams", Warning::DirichletNotConverged);
		}

		for (r, p) in (AMIN..ASIZE).enumerate() {
			let total = row_totals[r];
			let row = self.row_mut(p);
			for (j, cell) in row[AMIN..].iter_mut().enumerate() {
				*cell = ((*cell + u[j]) / (total + alpha)).ln();
			}
		}
	}

	/// Per-row maximum entropy fit against a uniform reference.
	fn smooth_maxent(&mut self, tolerances: &Tolerances) -> Result<()> {
		for p in AMIN..ASIZE {
			let counts = self.row(p)[AMIN..].to_vec();
			let log_probs = maxent_row(&counts, tolerances)?;
			self.row_mut(p)[AMIN..].copy_from_slice(&log_probs);
		}
		Ok(())
	}
}

/// Log partition function and divergence of one row, for weights `lambda`
/// against a uniform reference over `lambda.len()` symbols.
fn row_partition(lambda: &[f64], counts: &[f64], total: f64) -> (f64, f64) {
	let log_a = (lambda.len() as f64).ln();
	let max = lambda.iter().copied().fold(f64::NEG_INFINITY, f64::max);
	let sum: f64 = lambda.iter().map(|l| (l - max).exp()).sum();
	let log_z = max + sum.ln() - log_a;
	let expected: f64 = lambda.iter().zip(counts).map(|(l, c)| l * c / total).sum();
	(log_z, expected - log_z)
}

fn maxent_row(counts: &[f64], tolerances: &Tolerances) -> Result<Vec<f64>> {
	let width = counts.len();
	let log_a = (width as f64).ln();
	let total: f64 = counts.iter().sum();
	if total <= 0.0 {
		return Ok(vec![-log_a; width]);
	}
	let log_total = total.ln();
	let mut lambda = vec![0.0; width];
	let (mut log_z, mut divergence) = row_partition(&lambda, counts, total);
	for _ in 0..MAX_MAXENT_ITERATIONS {
		let mut max_delta: f64 = 0.0;
		for (l, &c) in lambda.iter_mut().zip(counts) {
			let old = *l;
			let target = if c > 0.0 { c.ln() - log_total + log_a + log_z } else { 0.0 };
			let next = target.clamp(old - tolerances.max_lambda_jump, old + tolerances.max_lambda_jump).max(0.0);
			max_delta = max_delta.max((next - old).abs());
			*l = next;
		}
		let (next_log_z, next_divergence) = row_partition(&lambda, counts, total);
		if next_log_z.is_nan() {
			return Err(MaxcatError::NumericalBlowup { order: 0 });
		}
		let settled = (next_divergence - divergence).abs() <= tolerances.digram_divergence
			&& max_delta <= tolerances.digram_lambda
			&& (next_log_z - log_z).abs() <= tolerances.digram_log_z;
		log_z = next_log_z;
		divergence = next_divergence;
		if settled {
			break;
		}
	}
	Ok(lambda.iter().map(|l| l - log_a - log_z).collect())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::token::{Token, TokenClass};

	fn counted(words: &[&str]) -> DigramTable {
		let mut table = DigramTable::new();
		for w in words {
			table.observe(Token::unigram(w.as_bytes(), TokenClass::Text).unwrap().text());
		}
		table
	}

	fn row_mass(table: &DigramTable, p: usize) -> f64 {
		table.row(p)[AMIN..].iter().map(|l| l.exp()).sum()
	}

	const WORDS: [&str; 8] = ["free", "money", "free", "offer", "meeting", "agenda", "zzz", "a"];

	#[test]
	fn observe_counts_transitions_and_length() {
		let table = counted(&["free"]);
		let d = DIAMOND as usize;
		assert_eq!(table.get(d, b'f' as usize), 1.0);
		assert_eq!(table.get(b'e' as usize, b'e' as usize), 1.0);
		assert_eq!(table.get(b'e' as usize, d), 1.0);
		assert_eq!(table.get(ROW_MARGINAL, b'e' as usize), 2.0);
		assert_eq!(table.get(ROW_TOKLEN, 5), 1.0);
		assert_eq!(table.row(ROW_TOKLEN).iter().sum::<f64>(), 1.0);
	}

	#[test]
	fn every_strategy_yields_distributions() {
		for smoothing in Smoothing::ALL {
			for encoding in [WeightEncoding::Float, WeightEncoding::Digitized] {
				let mut table = counted(&WORDS);
				let mut warnings = Warnings::default();
				table.smooth(smoothing, &Tolerances::default(), encoding, &mut warnings).unwrap();
				assert!(table.row(ROW_MARGINAL).iter().all(|&c| c == 0.0));
				if smoothing == Smoothing::TokLen {
					let log_a = alphabet_size().ln();
					let lengths: f64 =
						(2..=MAX_TOKEN_LEN + 1).map(|i| (table.get(ROW_TOKLEN, i) + i as f64 * log_a).exp()).sum();
					assert!((lengths - 1.0).abs() < 1e-4, "{} lengths sum to {}", encoding.name(), lengths);
					continue;
				}
				for p in AMIN..ASIZE {
					let mass = row_mass(&table, p);
					assert!((mass - 1.0).abs() < 1e-4, "{} row {} sums to {}", smoothing, p, mass);
				}
				assert!(table.row(ROW_TOKLEN).iter().all(|&c| c == 0.0));
			}
		}
	}

	#[test]
	fn empty_table_smooths_to_uniform() {
		for smoothing in [Smoothing::Dirichlet, Smoothing::MaxEnt, Smoothing::Mle, Smoothing::Iid] {
			let mut table = DigramTable::new();
			table.smooth(smoothing, &Tolerances::default(), WeightEncoding::Float, &mut Warnings::default()).unwrap();
			let expected = WeightEncoding::Float.quantize(-alphabet_size().ln());
			assert_eq!(table.get(b'a' as usize, b'b' as usize), expected);
		}
	}

	#[test]
	fn uniform_excursion_counts_transitions() {
		let mut table = counted(&WORDS);
		table.smooth(Smoothing::Uniform, &Tolerances::default(), WeightEncoding::Float, &mut Warnings::default()).unwrap();
		let token = Token::unigram(b"free", TokenClass::Text).unwrap();
		let step = WeightEncoding::Float.quantize(-alphabet_size().ln());
		assert!((table.excursion(token.text()) - 5.0 * step).abs() < 1e-9);
	}

	#[test]
	fn seen_transitions_are_more_likely() {
		for smoothing in [Smoothing::Dirichlet, Smoothing::MaxEnt, Smoothing::Mle] {
			let mut table = counted(&WORDS);
			table.smooth(smoothing, &Tolerances::default(), WeightEncoding::Float, &mut Warnings::default()).unwrap();
			let f = b'f' as usize;
			assert!(table.get(f, b'r' as usize) > table.get(f, b'q' as usize), "{}", smoothing);
		}
	}

	#[test]
	fn counts_add_elementwise() {
		let mut a = counted(&["free"]);
		let b = counted(&["free", "offer"]);
		assert!(!a.add_counts(&b));
		assert_eq!(a.get(ROW_TOKLEN, 5), 2.0);
		assert_eq!(a.get(ROW_TOKLEN, 6), 1.0);
		assert_eq!(a.get(DIAMOND as usize, b'f' as usize), 2.0);
		assert_eq!(a.get(DIAMOND as usize, b'o' as usize), 1.0);
	}

	#[test]
	fn toklen_scores_only_the_length() {
		let mut table = counted(&["free", "offer", "free"]);
		table.smooth(Smoothing::TokLen, &Tolerances::default(), WeightEncoding::Float, &mut Warnings::default()).unwrap();
		assert!(table.row(DIAMOND as usize)[AMIN..].iter().all(|&c| c == 0.0));
		assert_eq!(table.get(ROW_TOKLEN, 0), 0.0);

		// 30 bins: "free" seen twice, "offer" once, 28 empty bins counted once
		let total: f64 = 2.0 + 1.0 + 28.0;
		let log_a = alphabet_size().ln();
		let free = Token::unigram(b"free", TokenClass::Text).unwrap();
		let free_length = WeightEncoding::Float.quantize((2.0 / total).ln() - 5.0 * log_a);
		assert!((table.excursion(free.text()) - free_length).abs() < 1e-9);

		// A bigram has more transitions than counted length, only the length matters
		let pair = Token::from_subtokens(&["free", "offer"], TokenClass::Text).unwrap();
		let expected = WeightEncoding::Float.quantize((1.0 / total).ln() - 10.0 * log_a);
		assert!((table.excursion(pair.text()) - expected).abs() < 1e-9);
	}
}
