//! Run context passed to every core operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::SessionConfig;
use crate::error::{MaxcatError, Result};

/// Cooperative interruption flag.
///
/// Clones share the same flag, so a signal handler owned by the caller can
/// hold one while the fitter polls another.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
	pub fn trigger(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_triggered(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	pub fn reset(&self) {
		self.0.store(false, Ordering::SeqCst);
	}

	/// Returns `Err(Interrupted)` once triggered.
	pub fn check(&self) -> Result<()> {
		if self.is_triggered() { Err(MaxcatError::Interrupted) } else { Ok(()) }
	}
}

/// Configuration plus the interruption flag of one run.
#[derive(Debug, Clone, Default)]
pub struct Session {
	pub config: SessionConfig,
	interrupt: Interrupt,
}

impl Session {
	pub fn new(config: SessionConfig) -> Self {
		Self { config, interrupt: Interrupt::default() }
	}

	/// Handle the caller can trigger from a signal handler.
	pub fn interrupt(&self) -> Interrupt {
		self.interrupt.clone()
	}

	pub(crate) fn check_interrupt(&self) -> Result<()> {
		self.interrupt.check()
	}

	/// Random generator for reservoir sampling, seeded from the config if set.
	pub(crate) fn rng(&self) -> StdRng {
		match self.config.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_os_rng(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interrupt_is_shared() {
		let session = Session::default();
		let handle = session.interrupt();
		assert!(session.check_interrupt().is_ok());
		handle.trigger();
		assert!(matches!(session.check_interrupt(), Err(MaxcatError::Interrupted)));
		handle.reset();
		assert!(session.check_interrupt().is_ok());
	}
}
