use maxcat_core::config::SessionConfig;
use maxcat_core::{Classifier, Learner, Session, Token, TokenClass, TokenSink};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const SPAM: [&str; 4] = [
    "free money offer click now",
    "cheap pills free shipping",
    "win free money today",
    "limited offer click here now",
];

const HAM: [&str; 4] = [
    "meeting agenda for monday",
    "please review the attached notes",
    "lunch meeting moved to tuesday",
    "notes from the project review",
];

/// Splits a document on whitespace into unigrams and bigrams.
fn tokenize(doc: &str) -> Result<Vec<Token>, Box<dyn std::error::Error>> {
    let words: Vec<&str> = doc.split_whitespace().collect();
    let mut tokens = Vec::new();
    for word in &words {
        tokens.push(Token::unigram(word.as_bytes(), TokenClass::Text)?);
    }
    for pair in words.windows(2) {
        tokens.push(Token::from_subtokens(pair, TokenClass::Text)?);
    }
    Ok(tokens)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs are filtered with RUST_LOG, e.g. RUST_LOG=maxcat_core=debug
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    // Quality 3 tightens every tolerance of the fit
    let config = SessionConfig::default().with_quality(3);
    let session = Session::new(config);

    // Categories are written to a scratch directory
    let dir = tempfile::tempdir()?;
    let mut paths = Vec::new();

    for (name, docs) in [("spam", &SPAM), ("ham", &HAM)] {
        let mut learner = Learner::new(&session, name)?;
        for doc in docs.iter() {
            learner.feed_document(&tokenize(doc)?)?;
        }
        let path = dir.path().join(name);
        learner.optimize_and_save(&session, &path)?;
        println!(
            "{}: {} tokens, {} features, logZ {:.4}",
            name,
            learner.full_token_count(),
            learner.unique_token_count(),
            learner.fit_summary().log_z
        );
        paths.push(path);
    }

    // Load both categories and classify a few documents
    info!(count = paths.len(), dir = %dir.path().display(), "categories saved");
    let mut classifier = Classifier::open(&session, &paths)?;
    for doc in ["free offer now", "review the meeting notes", "something else entirely"] {
        classifier.feed_document(&tokenize(doc)?)?;
        if let Some(verdict) = classifier.last_verdict() {
            let best = classifier.categories()[verdict.best].name();
            println!("'{}' -> {} ({:.1}%)", doc, best, verdict.posteriors[verdict.best]);
        }
    }

    Ok(())
}
