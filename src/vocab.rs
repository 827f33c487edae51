//! Vocabulary construction and the bidirectional token ↔ id map.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};

use crate::reader::{read_lines, ReadMode};
use crate::{real, Word, UNK};

/// Token ↔ id map. Ids are assigned in insertion order, so the map doubles as
/// the canonical word ordering of the embedding tables and the output file.
#[derive(Default)]
pub struct IndexMap {
    k2i: HashMap<String, Word>,
    i2k: Vec<String>,
}

impl IndexMap {
    /// Insert a key, returning its id. Duplicate inserts are no-ops that
    /// return the existing id.
    pub fn insert(&mut self, key: &str) -> Word {
        if let Some(&id) = self.k2i.get(key) {
            return id;
        }
        let id = self.i2k.len() as Word;
        self.k2i.insert(key.to_string(), id);
        self.i2k.push(key.to_string());
        id
    }

    pub fn get(&self, key: &str) -> Option<Word> {
        self.k2i.get(key).copied()
    }

    pub fn has(&self, key: &str) -> bool {
        self.k2i.contains_key(key)
    }

    pub fn word(&self, id: Word) -> Option<&str> {
        self.i2k.get(id as usize).map(String::as_str)
    }

    /// All keys in id order.
    pub fn keys(&self) -> &[String] {
        &self.i2k
    }

    pub fn len(&self) -> usize {
        self.i2k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i2k.is_empty()
    }
}

/// Which vocabulary to use when continuing from pretrained embeddings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ContinueVocab {
    /// Words of the pretrained table only.
    Old,
    /// Words of the training corpus only.
    New,
    /// Both.
    Union,
}

/// Count token frequencies and lines across the training files.
pub fn build_vocab(
    paths: &[PathBuf],
    mode: ReadMode,
    strict: bool,
    show_progress: bool,
) -> Result<(HashMap<String, u64>, u64)> {
    let mut freqs: HashMap<String, u64> = HashMap::new();
    let mut lines: u64 = 0;

    let bar = if show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("Building vocab [{elapsed_precise}] {pos} lines ({per_sec})")
                .unwrap(),
        );
        Some(bar)
    } else {
        println!("Building vocab...");
        None
    };

    read_lines(paths, mode, strict, |line| {
        for token in line.split(' ').filter(|t| !t.is_empty()) {
            if let Some(count) = freqs.get_mut(token) {
                *count += 1;
            } else {
                freqs.insert(token.to_string(), 1);
            }
        }
        lines += 1;
        if let Some(bar) = &bar {
            bar.inc(1);
        }
        Ok(())
    })?;

    if let Some(bar) = &bar {
        bar.finish();
    }
    Ok((freqs, lines))
}

/// Turn raw frequency counts into the final ordered vocabulary: apply the UNK
/// sentinel, merge in pretrained words, drop rare words, sort by descending
/// count (ties by word, which keeps runs reproducible), and cap the size.
///
/// Returns the ordered vocabulary and the count map augmented with any
/// pretrained-only words (assumed count `min_count`).
pub fn assemble_vocab(
    mut freqs: HashMap<String, u64>,
    pretrained: &HashMap<String, Vec<real>>,
    continue_vocab: ContinueVocab,
    discard: bool,
    min_count: u64,
    vocab_size: Option<usize>,
) -> Result<(Vec<String>, HashMap<String, u64>)> {
    let mut ordered: Vec<String> = Vec::new();
    if !discard {
        ordered.push(UNK.to_string());
        freqs.insert(UNK.to_string(), 0);
    }

    if matches!(continue_vocab, ContinueVocab::Old | ContinueVocab::Union) {
        for word in pretrained.keys() {
            freqs.entry(word.clone()).or_insert(min_count);
        }
    }

    match continue_vocab {
        ContinueVocab::Old => {
            for word in pretrained.keys() {
                if freqs[word] >= min_count {
                    ordered.push(word.clone());
                }
            }
        }
        ContinueVocab::New | ContinueVocab::Union => {
            for (word, &count) in &freqs {
                if count >= min_count {
                    ordered.push(word.clone());
                }
            }
        }
    }

    // Keep UNK pinned at position 0 when it exists.
    let offset = usize::from(!discard);
    ordered[offset..].sort_by(|a, b| freqs[b].cmp(&freqs[a]).then_with(|| a.cmp(b)));

    if let Some(cap) = vocab_size {
        if cap < ordered.len() {
            ordered.truncate(cap);
        }
    }

    ensure!(
        ordered.len() < Word::MAX as usize,
        "vocabulary has {} words, too many for the word index type",
        ordered.len()
    );
    Ok((ordered, freqs))
}

/// Write `<token> <count>` lines in vocabulary order.
pub fn save_vocab(path: &Path, ordered: &[String], freqs: &HashMap<String, u64>) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("error creating vocab file {path:?}"))?,
    );
    for word in ordered {
        writeln!(out, "{} {}", word, freqs[word]).context("error writing vocab file")?;
    }
    out.flush().context("error writing vocab file")?;
    Ok(())
}

/// Load a `<token> <count>` vocabulary file. Counts must be descending; the
/// UNK sentinel is allowed only as the first line.
pub fn load_vocab(path: &Path) -> Result<(Vec<String>, HashMap<String, u64>)> {
    let mut ordered: Vec<String> = Vec::new();
    let mut freqs: HashMap<String, u64> = HashMap::new();
    let mut last = u64::MAX;

    let paths = [path.to_path_buf()];
    read_lines(&paths, ReadMode::Text, true, |line| {
        let fields: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
        ensure!(
            fields.len() == 2,
            "unexpected number of columns in vocab file {path:?} on line {}",
            ordered.len() + 1
        );
        let word = fields[0];
        let count: u64 = fields[1].parse().with_context(|| {
            format!(
                "unrecognized frequency number in vocab file {path:?} on line {}",
                ordered.len() + 1
            )
        })?;
        if word == UNK {
            ensure!(
                ordered.is_empty(),
                "only the first line of a vocab file may be {UNK}"
            );
        } else {
            ensure!(
                count <= last,
                "vocab file {path:?} is not in descending frequency order"
            );
            last = count;
        }
        ordered.push(word.to_string());
        freqs.insert(word.to_string(), count);
        Ok(())
    })?;

    Ok((ordered, freqs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_map_is_a_bijection() {
        let mut map = IndexMap::default();
        for key in ["hello", "world", "!"] {
            map.insert(key);
        }
        for id in 0..map.len() as Word {
            assert_eq!(map.get(map.word(id).unwrap()), Some(id));
        }
        for key in ["hello", "world", "!"] {
            assert_eq!(map.word(map.get(key).unwrap()), Some(key));
        }
    }

    #[test]
    fn index_map_duplicate_insert_is_a_noop() {
        let mut map = IndexMap::default();
        assert_eq!(map.insert("hello"), 0);
        assert_eq!(map.insert("world"), 1);
        assert_eq!(map.insert("hello"), 0);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("hello"), Some(0));
        assert_eq!(map.get("world"), Some(1));
    }

    #[test]
    fn index_map_membership_and_bounds() {
        let mut map = IndexMap::default();
        map.insert("hello");
        assert!(map.has("hello"));
        assert!(!map.has("world"));
        assert_eq!(map.get("world"), None);
        assert_eq!(map.word(0), Some("hello"));
        assert_eq!(map.word(1), None);
        assert_eq!(map.word(17), None);
    }

    #[test]
    fn assemble_sorts_by_count_then_word() {
        let freqs = HashMap::from([
            ("b".to_string(), 3u64),
            ("a".to_string(), 3),
            ("c".to_string(), 7),
            ("rare".to_string(), 1),
        ]);
        let (ordered, _) = assemble_vocab(
            freqs,
            &HashMap::new(),
            ContinueVocab::Union,
            true,
            2,
            None,
        )
        .unwrap();
        assert_eq!(ordered, ["c", "a", "b"]);
    }

    #[test]
    fn assemble_keeps_unk_first() {
        let freqs = HashMap::from([("a".to_string(), 3u64), ("b".to_string(), 9)]);
        let (ordered, freqs) = assemble_vocab(
            freqs,
            &HashMap::new(),
            ContinueVocab::Union,
            false,
            1,
            None,
        )
        .unwrap();
        assert_eq!(ordered, [UNK, "b", "a"]);
        assert_eq!(freqs[UNK], 0);
    }

    #[test]
    fn assemble_merges_pretrained_words() {
        let freqs = HashMap::from([("seen".to_string(), 5u64)]);
        let pretrained = HashMap::from([("extra".to_string(), vec![0.0, 0.0])]);
        let (ordered, freqs) = assemble_vocab(
            freqs,
            &pretrained,
            ContinueVocab::Union,
            true,
            1,
            None,
        )
        .unwrap();
        assert_eq!(ordered, ["seen", "extra"]);
        assert_eq!(freqs["extra"], 1);

        let freqs = HashMap::from([("seen".to_string(), 5u64)]);
        let (ordered, _) =
            assemble_vocab(freqs, &pretrained, ContinueVocab::Old, true, 1, None).unwrap();
        assert_eq!(ordered, ["extra"]);
    }

    #[test]
    fn assemble_caps_vocab_size() {
        let freqs = HashMap::from([
            ("a".to_string(), 3u64),
            ("b".to_string(), 2),
            ("c".to_string(), 1),
        ]);
        let (ordered, _) = assemble_vocab(
            freqs,
            &HashMap::new(),
            ContinueVocab::Union,
            true,
            1,
            Some(2),
        )
        .unwrap();
        assert_eq!(ordered, ["a", "b"]);
    }

    #[test]
    fn vocab_file_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.vocab");
        let ordered = vec!["the".to_string(), "cat".to_string()];
        let freqs = HashMap::from([("the".to_string(), 10u64), ("cat".to_string(), 2)]);
        save_vocab(&path, &ordered, &freqs).unwrap();

        let (loaded, loaded_freqs) = load_vocab(&path).unwrap();
        assert_eq!(loaded, ordered);
        assert_eq!(loaded_freqs, freqs);

        let bad = dir.path().join("ascending.vocab");
        let mut f = File::create(&bad).unwrap();
        writeln!(f, "cat 2").unwrap();
        writeln!(f, "the 10").unwrap();
        drop(f);
        assert!(load_vocab(&bad).is_err());

        let bad = dir.path().join("columns.vocab");
        let mut f = File::create(&bad).unwrap();
        writeln!(f, "the 10 extra").unwrap();
        drop(f);
        assert!(load_vocab(&bad).is_err());

        let bad = dir.path().join("unk.vocab");
        let mut f = File::create(&bad).unwrap();
        writeln!(f, "the 10").unwrap();
        writeln!(f, "{UNK} 0").unwrap();
        drop(f);
        assert!(load_vocab(&bad).is_err());
    }
}
