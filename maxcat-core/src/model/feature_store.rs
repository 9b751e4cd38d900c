use std::mem;

use crate::config::StoreConfig;
use crate::error::{Warning, Warnings};
use crate::token::TokenClass;

/// A distinct token seen during learning.
///
/// # Invariants
/// - `id` is never zero
/// - `lambda` is never negative once fitted
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
	pub id: u64,
	pub count: u32,
	pub order: u8,
	pub class: TokenClass,
	pub lambda: f64,
	/// Sum of the weights of the proper suffixes (fitting scratch).
	pub(crate) left: f64,
	/// Digramic excursion of the token text (fitting scratch).
	pub(crate) right: f64,
	/// Accumulated share of each document this feature occupied.
	pub(crate) doc_weight: f64,
}

impl Feature {
	pub(crate) fn new(id: u64, order: u8, class: TokenClass) -> Self {
		Self { id, count: 0, order, class, lambda: 0.0, left: 0.0, right: 0.0, doc_weight: 0.0 }
	}

	/// Reference log-weight computed during the last fit.
	pub fn reference_weight(&self) -> f64 {
		self.right
	}
}

/// State of a single table slot.
///
/// `Marked` only exists while the table is being rehashed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Slot {
	#[default]
	Empty,
	Filled(Feature),
	Marked(Feature),
}

impl Slot {
	pub fn feature(&self) -> Option<&Feature> {
		match self {
			Slot::Filled(f) | Slot::Marked(f) => Some(f),
			Slot::Empty => None,
		}
	}

	fn feature_mut(&mut self) -> Option<&mut Feature> {
		match self {
			Slot::Filled(f) | Slot::Marked(f) => Some(f),
			Slot::Empty => None,
		}
	}
}

/// Outcome of probing for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
	Found(usize),
	/// First empty slot of the probe sequence.
	Vacant(usize),
	/// Every slot was visited without a match or a vacancy.
	Full,
}

/// Outcome of `insert_or_increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
	New(usize),
	Existing(usize),
	/// Unseen id dropped because the table is at its load limit.
	Rejected,
}

/// Open-addressing table of features keyed by token id.
///
/// # Responsibilities
/// - Linear probing from `id & (capacity - 1)`
/// - Doubling growth once the load factor reaches `load_percent`
/// - Saturating counts and the running maximum count
///
/// # Invariants
/// - `capacity` is a power of two
/// - no two live slots share an id
/// - `unique_count` equals the number of filled slots
#[derive(Debug, Clone)]
pub struct FeatureStore {
	slots: Vec<Slot>,
	hash_bits: u8,
	config: StoreConfig,
	unique_count: usize,
	max_count: u32,
	growth_enabled: bool,
	pub(crate) warnings: Warnings,
}

impl FeatureStore {
	/// Creates an empty table of `2^config.hash_bits` slots.
	pub fn new(config: StoreConfig) -> Self {
		let hash_bits = config.hash_bits.clamp(1, 63);
		Self {
			slots: vec![Slot::Empty; 1usize << hash_bits],
			hash_bits,
			config,
			unique_count: 0,
			max_count: 0,
			growth_enabled: config.growable,
			warnings: Warnings::default(),
		}
	}

	/// Rebuilds a table from persisted slots.
	///
	/// # Returns
	/// `None` if the slot count is not a power of two.
	pub(crate) fn from_slots(slots: Vec<Slot>, config: StoreConfig) -> Option<Self> {
		if !slots.len().is_power_of_two() || slots.len() < 2 {
			return None;
		}
		let hash_bits = slots.len().trailing_zeros() as u8;
		let unique_count = slots.iter().filter(|s| s.feature().is_some()).count();
		let max_count = slots.iter().filter_map(|s| s.feature()).map(|f| f.count).max().unwrap_or(0);
		Some(Self {
			slots,
			hash_bits,
			config,
			unique_count,
			max_count,
			growth_enabled: config.growable,
			warnings: Warnings::default(),
		})
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	pub fn config(&self) -> StoreConfig {
		self.config
	}

	pub fn hash_bits(&self) -> u8 {
		self.hash_bits
	}

	pub fn unique_count(&self) -> usize {
		self.unique_count
	}

	/// Largest count of any single feature.
	pub fn max_count(&self) -> u32 {
		self.max_count
	}

	pub fn slots(&self) -> &[Slot] {
		&self.slots
	}

	/// Whether one more distinct feature would reach the load limit.
	pub fn at_load_limit(&self) -> bool {
		self.unique_count * 100 >= self.config.load_percent as usize * self.capacity()
	}

	/// Probes for `id`.
	///
	/// # Behavior
	/// Starts at `id & (capacity - 1)` and walks forward, wrapping at the end,
	/// until the id, an empty slot, or the start slot again is reached.
	pub fn find(&self, id: u64) -> Probe {
		let mask = self.capacity() - 1;
		let start = (id as usize) & mask;
		let mut i = start;
		loop {
			match &self.slots[i] {
				Slot::Empty => return Probe::Vacant(i),
				Slot::Filled(f) | Slot::Marked(f) if f.id == id => return Probe::Found(i),
				_ => {}
			}
			i = (i + 1) & mask;
			if i == start {
				return Probe::Full;
			}
		}
	}

	pub fn get(&self, id: u64) -> Option<&Feature> {
		match self.find(id) {
			Probe::Found(i) => self.slots[i].feature(),
			_ => None,
		}
	}

	pub fn get_mut(&mut self, id: u64) -> Option<&mut Feature> {
		match self.find(id) {
			Probe::Found(i) => self.slots[i].feature_mut(),
			_ => None,
		}
	}

	pub fn feature(&self, index: usize) -> Option<&Feature> {
		self.slots.get(index).and_then(Slot::feature)
	}

	pub fn feature_mut(&mut self, index: usize) -> Option<&mut Feature> {
		self.slots.get_mut(index).and_then(Slot::feature_mut)
	}

	/// Filled slots in table order.
	pub fn iter(&self) -> impl Iterator<Item = &Feature> {
		self.slots.iter().filter_map(Slot::feature)
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Feature> {
		self.slots.iter_mut().filter_map(Slot::feature_mut)
	}

	/// Filled slots, front to back when `forward`, back to front otherwise.
	pub fn ordered(&self, forward: bool) -> Box<dyn Iterator<Item = &Feature> + '_> {
		if forward {
			Box::new(self.slots.iter().filter_map(Slot::feature))
		} else {
			Box::new(self.slots.iter().rev().filter_map(Slot::feature))
		}
	}

	/// Counts one occurrence of `id`.
	///
	/// # Behavior
	/// - Grows the table first when an unseen id would reach the load limit.
	/// - On first sight fills the slot with `order`, `class` and a zero weight.
	/// - Increments the count, saturating at `u32::MAX`.
	///
	/// # Returns
	/// Where the feature lives, or `Rejected` if the table is full and
	/// cannot grow.
	pub fn insert_or_increment(&mut self, id: u64, order: u8, class: TokenClass) -> Insert {
		match self.claim(id, order, class) {
			Insert::Rejected => Insert::Rejected,
			claimed @ (Insert::New(i) | Insert::Existing(i)) => {
				self.add_count(i, 1);
				claimed
			}
		}
	}

	/// Finds or creates the slot for `id` without counting it.
	pub(crate) fn claim(&mut self, id: u64, order: u8, class: TokenClass) -> Insert {
		let mut probe = self.find(id);
		if !matches!(probe, Probe::Found(_)) && self.at_load_limit() && self.try_grow() {
			probe = self.find(id);
		}
		match probe {
			Probe::Found(i) => Insert::Existing(i),
			Probe::Vacant(i) if !self.at_load_limit() => {
				self.slots[i] = Slot::Filled(Feature::new(id, order, class));
				self.unique_count += 1;
				Insert::New(i)
			}
			_ => {
				self.warnings.raise("features", Warning::TableFull);
				Insert::Rejected
			}
		}
	}

	/// Adds `by` to the count at `index`, saturating.
	pub(crate) fn add_count(&mut self, index: usize, by: u32) {
		let Some(feature) = self.slots[index].feature_mut() else {
			return;
		};
		feature.count = match feature.count.checked_add(by) {
			Some(count) => count,
			None => {
				self.warnings.raise("features", Warning::CountOverflow);
				u32::MAX
			}
		};
		self.max_count = self.max_count.max(feature.count);
	}

	fn try_grow(&mut self) -> bool {
		if !self.growth_enabled {
			return false;
		}
		if self.hash_bits >= self.config.max_hash_bits {
			self.disable_growth();
			return false;
		}
		self.grow()
	}

	fn disable_growth(&mut self) {
		self.growth_enabled = false;
		self.warnings.raise("features", Warning::GrowthDisabled);
	}

	/// Doubles the capacity and rehashes every feature in place.
	///
	/// # Behavior
	/// - Every filled slot is marked.
	/// - Each marked slot is relocated along its probe sequence in the new
	///   table. A probe stops at the first empty or still-marked slot; a marked
	///   destination is swapped with the current slot, which is then processed
	///   again.
	///
	/// # Returns
	/// `false` if the memory for the larger table could not be reserved, in
	/// which case growth is disabled for good.
	///
	/// # Notes
	/// Terminates because the doubled table always has more slots than there
	/// are marked features.
	pub fn grow(&mut self) -> bool {
		let old_capacity = self.capacity();
		if self.slots.try_reserve_exact(old_capacity).is_err() {
			self.disable_growth();
			return false;
		}
		self.slots.resize(old_capacity * 2, Slot::Empty);
		self.hash_bits += 1;

		for slot in self.slots[..old_capacity].iter_mut() {
			*slot = match mem::take(slot) {
				Slot::Filled(f) => Slot::Marked(f),
				other => other,
			};
		}

		let mask = self.capacity() - 1;
		for c in 0..old_capacity {
			while let Slot::Marked(f) = &self.slots[c] {
				let mut i = (f.id as usize) & mask;
				while matches!(self.slots[i], Slot::Filled(_)) {
					i = (i + 1) & mask;
				}
				self.slots[c] = match mem::take(&mut self.slots[c]) {
					Slot::Marked(f) => Slot::Filled(f),
					other => other,
				};
				if i != c {
					self.slots.swap(i, c);
				}
			}
		}
		true
	}

	/// Zeroes every fitted weight and scratch field.
	pub(crate) fn reset_weights(&mut self) {
		for f in self.iter_mut() {
			f.lambda = 0.0;
			f.left = 0.0;
			f.right = 0.0;
		}
	}
}
