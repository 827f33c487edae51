//! Shared embedding tables.
//!
//! Rows are read and written concurrently by every worker with no locks and
//! no compare-and-swap: each entry is a `real` bit pattern in a relaxed
//! atomic, so a read-modify-write from two threads can lose one delta. That
//! is the intended trade (Hogwild-style SGD) -- contention on any single row
//! is rare relative to the row count, and the lost updates amount to a little
//! extra gradient noise. Do not add row locks here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;

#[cfg(not(feature = "grad-check"))]
use std::sync::atomic::AtomicU32 as AtomicBits;
#[cfg(feature = "grad-check")]
use std::sync::atomic::AtomicU64 as AtomicBits;
use std::sync::atomic::Ordering;

use aligned_box::AlignedBox;
use anyhow::{ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::reader::{read_lines, ReadMode};
use crate::vocab::IndexMap;
use crate::{real, Word};

/// One embedding entry: a `real` stored as bits in a relaxed atomic.
#[derive(Default)]
#[repr(transparent)]
pub struct Cell {
    bits: AtomicBits,
}

impl Cell {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Unsynchronized read-modify-write; concurrent callers may lose a delta.
    pub fn add(&self, x: real) {
        self.set(self.get() + x);
    }
}

/// A dense table of `words` x `dim` entries, flat and cache-aligned.
pub struct Table {
    words: usize,
    dim: usize,
    cells: AlignedBox<[Cell]>,
}

impl Table {
    pub fn zeros(words: usize, dim: usize) -> Table {
        Table {
            words,
            dim,
            cells: AlignedBox::slice_from_default(128, words * dim)
                .expect("memory allocation failed"),
        }
    }

    pub fn row(&self, w: Word) -> &[Cell] {
        &self.cells[w as usize * self.dim..][..self.dim]
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// Dot product of a scratch vector with a table row.
pub fn dot_cells(a: &[real], b: &[Cell]) -> real {
    a.iter().zip(b).map(|(&x, cell)| x * cell.get()).sum()
}

/// Dot product of two table rows.
pub fn dot_rows(a: &[Cell], b: &[Cell]) -> real {
    a.iter().zip(b).map(|(x, y)| x.get() * y.get()).sum()
}

/// Initialize the input table from pretrained vectors where available and
/// small uniform noise elsewhere; zero the output table. Runs single-threaded
/// before training with a fixed seed, so a given configuration always starts
/// from the same point.
pub fn init_tables(
    table: &Table,
    ctx: &Table,
    vocab: &IndexMap,
    pretrained: &HashMap<String, Vec<real>>,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let half = 0.5 / table.dim() as real;
    for (w, word) in vocab.keys().iter().enumerate() {
        let row = table.row(w as Word);
        if let Some(vector) = pretrained.get(word.as_str()) {
            for (cell, &x) in row.iter().zip(vector) {
                cell.set(x);
            }
        } else {
            for cell in row {
                cell.set(rng.gen_range(-half..=half));
            }
        }
        for cell in ctx.row(w as Word) {
            cell.set(0.0);
        }
    }
}

/// Load a `<token> <f1> ... <fD>` embedding file. The dimension must match
/// and duplicate tokens are an error.
pub fn load_pretrained(
    path: &Path,
    mode: ReadMode,
    dim: usize,
    strict: bool,
) -> Result<HashMap<String, Vec<real>>> {
    let mut table: HashMap<String, Vec<real>> = HashMap::new();
    let paths = [path.to_path_buf()];
    read_lines(&paths, mode, strict, |line| {
        let mut fields = line.split(' ').filter(|t| !t.is_empty());
        let word = fields
            .next()
            .with_context(|| format!("empty line in pretrained table {path:?}"))?;
        let vector: Vec<real> = fields
            .map(|t| t.parse::<real>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("bad number in pretrained table entry for '{word}'"))?;
        ensure!(
            vector.len() == dim,
            "pretrained vector for '{word}' has dimension {}, expected {dim}",
            vector.len()
        );
        ensure!(
            table.insert(word.to_string(), vector).is_none(),
            "pretrained table has duplicate entries for '{word}'"
        );
        Ok(())
    })?;
    Ok(table)
}

/// Write one `<token> <f1> ... <fD>` line per word, in vocabulary order.
pub fn save_embeddings(path: &Path, vocab: &IndexMap, table: &Table) -> Result<()> {
    let mut out = BufWriter::new(
        File::create(path).with_context(|| format!("error creating output file {path:?}"))?,
    );
    for (w, word) in vocab.keys().iter().enumerate() {
        write!(out, "{word}").context("error writing output file")?;
        for cell in table.row(w as Word) {
            write!(out, " {}", cell.get()).context("error writing output file")?;
        }
        writeln!(out).context("error writing output file")?;
    }
    out.flush().context("error writing output file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab_of(words: &[&str]) -> IndexMap {
        let mut map = IndexMap::default();
        for w in words {
            map.insert(w);
        }
        map
    }

    #[test]
    fn cells_round_trip_and_accumulate() {
        let cell = Cell::default();
        assert_eq!(cell.get(), 0.0);
        cell.set(1.5);
        cell.add(-0.25);
        assert_eq!(cell.get(), 1.25);
    }

    #[test]
    fn zeroed_table_has_expected_shape() {
        let table = Table::zeros(3, 4);
        assert_eq!(table.words(), 3);
        assert_eq!(table.dim(), 4);
        for w in 0..3 {
            assert_eq!(table.row(w).len(), 4);
            assert!(table.row(w).iter().all(|c| c.get() == 0.0));
        }
    }

    #[test]
    fn init_overlays_pretrained_and_bounds_random_rows() {
        let vocab = vocab_of(&["known", "fresh"]);
        let table = Table::zeros(2, 4);
        let ctx = Table::zeros(2, 4);
        for cell in ctx.row(1) {
            cell.set(9.0);
        }
        let pretrained = HashMap::from([("known".to_string(), vec![0.1, -0.2, 0.3, -0.4])]);
        init_tables(&table, &ctx, &vocab, &pretrained, 42);

        let known: Vec<real> = table.row(0).iter().map(Cell::get).collect();
        assert_eq!(known, vec![0.1, -0.2, 0.3, -0.4]);
        let half = 0.5 / 4.0;
        for cell in table.row(1) {
            assert!(cell.get().abs() <= half);
        }
        assert!(ctx.row(1).iter().all(|c| c.get() == 0.0));
    }

    #[test]
    fn init_is_deterministic_for_a_seed() {
        let vocab = vocab_of(&["a", "b"]);
        let none = HashMap::new();
        let first = Table::zeros(2, 8);
        let second = Table::zeros(2, 8);
        let ctx = Table::zeros(2, 8);
        init_tables(&first, &ctx, &vocab, &none, 123457);
        init_tables(&second, &ctx, &vocab, &none, 123457);
        for w in 0..2 {
            for (a, b) in first.row(w).iter().zip(second.row(w)) {
                assert_eq!(a.get(), b.get());
            }
        }
    }

    #[test]
    fn pretrained_load_validates_dimension_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.txt");
        writeln!(File::create(&good).unwrap(), "cat 0.5 -1.25\ndog 1 2").unwrap();
        let table = load_pretrained(&good, ReadMode::Auto, 2, false).unwrap();
        assert_eq!(table["cat"], vec![0.5, -1.25]);
        assert_eq!(table["dog"], vec![1.0, 2.0]);

        let short = dir.path().join("short.txt");
        writeln!(File::create(&short).unwrap(), "cat 0.5").unwrap();
        assert!(load_pretrained(&short, ReadMode::Auto, 2, false).is_err());

        let dup = dir.path().join("dup.txt");
        writeln!(File::create(&dup).unwrap(), "cat 1 2\ncat 3 4").unwrap();
        assert!(load_pretrained(&dup, ReadMode::Auto, 2, false).is_err());
    }

    #[test]
    fn saved_embeddings_reload_identically() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = vocab_of(&["a", "b", "c"]);
        let table = Table::zeros(3, 5);
        let ctx = Table::zeros(3, 5);
        init_tables(&table, &ctx, &vocab, &HashMap::new(), 7);

        let path = dir.path().join("embeddings.txt");
        save_embeddings(&path, &vocab, &table).unwrap();
        let loaded = load_pretrained(&path, ReadMode::Auto, 5, true).unwrap();
        assert_eq!(loaded.len(), 3);
        for (w, word) in vocab.keys().iter().enumerate() {
            let row: Vec<real> = table.row(w as Word).iter().map(Cell::get).collect();
            assert_eq!(loaded[word.as_str()], row);
        }
    }
}
