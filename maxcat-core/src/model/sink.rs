use super::learner::Learner;
use super::scorer::Classifier;
use crate::error::Result;
use crate::token::Token;

/// Consumer of a tokenized document stream.
///
/// Tokenizers feed every token of a document, then end it.
pub trait TokenSink {
	fn feed(&mut self, token: &Token) -> Result<()>;

	fn end_document(&mut self) -> Result<()>;

	/// Feeds a whole document and ends it.
	fn feed_document<'t, I>(&mut self, tokens: I) -> Result<()>
	where
		I: IntoIterator<Item = &'t Token>,
		Self: Sized,
	{
		for token in tokens {
			self.feed(token)?;
		}
		self.end_document()
	}
}

impl TokenSink for Learner {
	fn feed(&mut self, token: &Token) -> Result<()> {
		self.learn(token)
	}

	fn end_document(&mut self) -> Result<()> {
		Learner::end_document(self);
		Ok(())
	}
}

impl TokenSink for Classifier {
	fn feed(&mut self, token: &Token) -> Result<()> {
		self.score_token(token);
		Ok(())
	}

	fn end_document(&mut self) -> Result<()> {
		self.finish_document();
		Ok(())
	}
}

/// The sink of a run, chosen once up front.
pub enum Sink {
	Learn(Learner),
	Classify(Classifier),
}

impl TokenSink for Sink {
	fn feed(&mut self, token: &Token) -> Result<()> {
		match self {
			Sink::Learn(learner) => learner.feed(token),
			Sink::Classify(classifier) => classifier.feed(token),
		}
	}

	fn end_document(&mut self) -> Result<()> {
		match self {
			Sink::Learn(learner) => TokenSink::end_document(learner),
			Sink::Classify(classifier) => TokenSink::end_document(classifier),
		}
	}
}
