//! Word embedding training by negative sampling, with both the continuous
//! bag-of-words (CBOW) and skip-gram objectives.
//!
//! The CBOW update here normalizes the gradient flowing back to each context
//! vector by the number of context words that contributed to the mean, which
//! the classic word2vec implementation omits. `use_bad_update` restores the
//! unnormalized behavior for head-to-head comparisons.
//!
//! Training is lock-free multi-threaded SGD: worker threads read and write
//! the shared embedding tables concurrently with relaxed atomics and no row
//! locks, so concurrent updates to the same row may tear or overwrite each
//! other. That noise is part of the contract (see [`table`]).

pub mod parallel;
pub mod probs;
pub mod reader;
pub mod sample;
pub mod sigmoid;
pub mod table;
pub mod train;
pub mod trainer;
pub mod vocab;

/// Precision of the embedding tables and all training math. `f64` under the
/// `grad-check` feature so numerical gradient comparisons are meaningful.
#[allow(non_camel_case_types)]
#[cfg(not(feature = "grad-check"))]
pub type real = f32;
#[allow(non_camel_case_types)]
#[cfg(feature = "grad-check")]
pub type real = f64;

/// Vocabulary index of a token.
pub type Word = u32;
/// One input line, resolved to token ids.
pub type Sentence = Vec<Word>;
/// A batch of sentences as produced by a [`reader::Reader`].
pub type Sentences = Vec<Sentence>;

/// Sentinel token that unknown words map to when they are not discarded.
pub const UNK: &str = "___UNK___";

/// Seed for embedding initialization; per-thread seeds derive from it.
pub const GLOBAL_SEED: u64 = 123457;
