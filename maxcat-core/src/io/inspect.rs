use std::io::Write;

use super::header::CategoryHeader;
use crate::error::Result;
use crate::model::learner::Learner;
use crate::weight::ByteOrder;

impl Learner {
	/// Writes a human-readable listing of the model.
	///
	/// The category header comes first, then one line per spooled token:
	/// `weight reference-weight count id text`, in learning order. Tokens
	/// that never made it into the feature table are skipped.
	pub fn dump_plaintext<W: Write>(&self, out: &mut W) -> Result<()> {
		out.write_all(CategoryHeader::from_learner(self, ByteOrder::native()).render().as_bytes())?;
		self.spool.for_each(|token| {
			if let Some(f) = self.store.get(token.id()) {
				writeln!(out, "{:.6} {:.6} {} {:016x} {}", f.lambda, f.reference_weight(), f.count, f.id, token)?;
			}
			Ok(())
		})
	}
}
