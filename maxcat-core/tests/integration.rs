use std::fs;
use std::path::Path;

use maxcat_core::config::{SaveOptions, SessionConfig, Smoothing};
use maxcat_core::io::category_file::PartialSave;
use maxcat_core::weight::WeightEncoding;
use maxcat_core::{Category, Classifier, Learner, MaxcatError, Session, Token, TokenClass, TokenSink};
use tracing_subscriber::EnvFilter;

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

fn init_logging() {
	let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();
}

/// Unigrams then bigrams of a whitespace-split document.
fn tokens(doc: &str) -> Vec<Token> {
	let words: Vec<&str> = doc.split_whitespace().collect();
	let mut tokens: Vec<Token> = words.iter().map(|w| Token::unigram(w.as_bytes(), TokenClass::Text).unwrap()).collect();
	tokens.extend(words.windows(2).map(|pair| Token::from_subtokens(pair, TokenClass::Text).unwrap()));
	tokens
}

fn learn(session: &Session, name: &str, docs: &[&str]) -> Learner {
	let mut learner = Learner::new(session, name).unwrap();
	for doc in docs {
		learner.feed_document(&tokens(doc)).unwrap();
	}
	learner
}

fn small_session() -> Session {
	let mut config = SessionConfig::default();
	config.store.hash_bits = 8;
	Session::new(config)
}

fn scores(category: &Category, docs: &[&str]) -> Vec<f64> {
	docs.iter().flat_map(|doc| tokens(doc)).map(|t| category.contribution(&t).value).collect()
}

#[test]
fn spam_and_ham_are_told_apart() {
	init_logging();
	let session = small_session();
	let dir = tempfile::tempdir().unwrap();
	let spam_path = dir.path().join("spam");
	let ham_path = dir.path().join("ham");
	learn(&session, "spam", &SPAM).optimize_and_save(&session, &spam_path).unwrap();
	learn(&session, "ham", &HAM).optimize_and_save(&session, &ham_path).unwrap();

	let mut classifier = Classifier::open(&session, &[&spam_path, &ham_path]).unwrap();
	assert_eq!(classifier.categories()[0].name(), "spam");

	classifier.feed_document(&tokens("free money click")).unwrap();
	let verdict = classifier.last_verdict().unwrap().clone();
	assert_eq!(verdict.index(), 1);
	assert!((verdict.posteriors.iter().sum::<f64>() - 100.0).abs() < 1e-9);
	assert!(verdict.posteriors[0] > 50.0);

	classifier.feed_document(&tokens("review the meeting notes")).unwrap();
	assert_eq!(classifier.last_verdict().unwrap().index(), 2);
	assert!(classifier.scores().iter().all(|s| s.complexity == 0));
}

#[test]
fn loaded_categories_score_like_memory() {
	init_logging();
	let probe = ["free money meeting", "unseen words entirely", "review notes now"];
	for encoding in [WeightEncoding::Float, WeightEncoding::Digitized] {
		let mut session = small_session();
		session.config.model.encoding = encoding;
		session.config.model.smoothing = Smoothing::Dirichlet;
		let mut learner = learn(&session, "spam", &SPAM);
		let tolerances = session.config.tolerances;
		learner.optimize(&session, &tolerances).unwrap();
		let expected = scores(&Category::from_learner(&learner).unwrap(), &probe);

		let dir = tempfile::tempdir().unwrap();
		for portable in [false, true] {
			let path = dir.path().join(format!("spam-{}", portable));
			learner.save_category(&path, &SaveOptions { portable, ..SaveOptions::default() }).unwrap();
			for mmap in [false, true] {
				let loaded = Category::open(&path, mmap).unwrap();
				assert_eq!(loaded.header().options.encoding, encoding);
				assert_eq!(scores(&loaded, &probe), expected, "portable {} mmap {}", portable, mmap);
			}
		}
	}
}

#[test]
fn fast_partial_save_updates_in_place() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("spam");
	let session = small_session();
	learn(&session, "spam", &SPAM).optimize_and_save(&session, &path).unwrap();
	let full = fs::read(&path).unwrap();

	let mut partial = small_session();
	partial.config.save.fast_partial = true;
	let learner = {
		let mut learner = learn(&partial, "spam", &SPAM);
		learner.optimize_and_save(&partial, &path).unwrap();
		learner
	};
	assert_eq!(fs::read(&path).unwrap(), full);
	assert_eq!(learner.fast_partial_save(&path, &partial.config.save).unwrap(), PartialSave::Written);
	assert_eq!(fs::read(&path).unwrap(), full);
}

#[test]
fn fast_partial_save_refuses_changed_options() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("spam");
	let session = small_session();
	learn(&session, "spam", &SPAM).optimize_and_save(&session, &path).unwrap();
	let before = fs::read(&path).unwrap();

	let mut other = small_session();
	other.config.model.min_count = 1;
	let mut learner = learn(&other, "spam", &SPAM);
	let tolerances = other.config.tolerances;
	learner.optimize(&other, &tolerances).unwrap();
	let outcome = learner.fast_partial_save(&path, &other.config.save).unwrap();
	assert_eq!(outcome, PartialSave::Unavailable("options differ".to_owned()));
	assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn resumed_learning_matches_one_pass() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let dump = dir.path().join("spam.online");
	let session = small_session();

	learn(&session, "spam", &SPAM[..2]).write_online_dump(&dump).unwrap();
	let mut resumed = Learner::resume(&session, &dump).unwrap();
	for doc in &SPAM[2..] {
		resumed.feed_document(&tokens(doc)).unwrap();
	}
	let mut direct = learn(&session, "spam", &SPAM);

	let tolerances = session.config.tolerances;
	resumed.optimize(&session, &tolerances).unwrap();
	direct.optimize(&session, &tolerances).unwrap();
	assert_eq!(resumed.stats(), direct.stats());
	assert_eq!(resumed.fit_summary(), direct.fit_summary());
	let weights = |l: &Learner| l.store().iter().map(|f| (f.id, f.count, f.lambda)).collect::<Vec<_>>();
	assert_eq!(weights(&resumed), weights(&direct));
}

#[test]
fn online_dump_is_written_before_fitting() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let mut session = small_session();
	session.config.online_dump = Some(dir.path().join("ham.online"));
	learn(&session, "ham", &HAM).optimize_and_save(&session, dir.path().join("ham")).unwrap();

	let mut merged = learn(&session, "ham", &[]);
	merged.merge_dump(&session, dir.path().join("ham.online")).unwrap();
	let direct = learn(&session, "ham", &HAM);
	assert_eq!(merged.stats(), direct.stats());
	assert_eq!(merged.unique_token_count(), direct.unique_token_count());
}

#[test]
fn foreign_files_are_left_alone() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("notes.txt");
	fs::write(&path, "do not overwrite me").unwrap();
	let session = small_session();
	let result = learn(&session, "spam", &SPAM).optimize_and_save(&session, &path);
	assert!(matches!(result, Err(MaxcatError::ForeignFile { .. })));
	assert_eq!(fs::read_to_string(&path).unwrap(), "do not overwrite me");
	assert!(matches!(Category::open(&path, false), Err(MaxcatError::ForeignFile { .. })));
}

#[test]
fn other_versions_are_reported() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("future");
	fs::write(&path, "#maxcat category v7 spam\n#data\n").unwrap();
	match Category::open(&path, true) {
		Err(MaxcatError::VersionMismatch { found, .. }) => assert_eq!(found, "7"),
		Err(e) => panic!("unexpected error {}", e),
		Ok(_) => panic!("future version accepted"),
	}
}

#[test]
fn interrupted_run_saves_nothing() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("spam");
	let session = small_session();
	let mut learner = learn(&session, "spam", &SPAM);
	session.interrupt().trigger();
	assert!(matches!(learner.optimize_and_save(&session, &path), Err(MaxcatError::Interrupted)));
	assert!(!Path::new(&path).exists());
}

#[test]
fn toml_configures_a_run() {
	let config = SessionConfig::from_toml_str(
		r#"
		prior_correction = true
		[model]
		smoothing = "toklen"
		[store]
		hash_bits = 7
		"#,
	)
	.unwrap();
	let session = Session::new(config);
	let mut learner = learn(&session, "ham", &HAM);
	let tolerances = session.config.tolerances;
	learner.optimize(&session, &tolerances).unwrap();
	let category = Category::from_learner(&learner).unwrap();
	assert_eq!(category.header().options.smoothing, Smoothing::TokLen);
	assert_eq!(category.header().hash_bits, 7);

	let mut classifier = Classifier::new(vec![category], session.config.prior_correction);
	classifier.feed_document(&tokens("agenda notes")).unwrap();
	let verdict = classifier.last_verdict().unwrap();
	assert_eq!(verdict.posteriors, vec![100.0]);
}
