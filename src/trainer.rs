//! CBOW and skip-gram updates by negative sampling, plus the per-sentence
//! driver that subsamples tokens and draws context windows.
//!
//! In CBOW the loss gradient with respect to each context vector carries a
//! 1/K factor from the context mean (K = number of context words). The
//! classic word2vec implementation drops that factor; `use_bad_update`
//! reproduces the dropped-factor behavior for benchmarking and is off by
//! default.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sample::AliasSampler;
use crate::sigmoid::{sigmoid, MIN_SIGMOID_IN_LOSS};
use crate::table::{dot_cells, dot_rows, Table};
use crate::{real, Sentence, Word, GLOBAL_SEED};

/// Seed base for per-thread window-size draws.
const WINDOW_SEED: u64 = 389251;
/// Seed base for per-thread negative samplers.
const SAMPLER_SEED: u64 = 710143;

/// Knobs of the update kernels. The surrounding training loop owns its own
/// record (epochs, learning-rate schedule, dispatch policy).
#[derive(Clone, Copy, Debug)]
pub struct Params {
    pub dim: usize,
    /// Cap on the one-sided context width; each center draws from [1, ctxs].
    pub ctxs: usize,
    /// Negative samples per positive target.
    pub negatives: usize,
    /// Worker count; sizes the arena of per-thread state.
    pub threads: usize,
    /// Drop the 1/K normalization from the CBOW context gradient.
    pub use_bad_update: bool,
}

/// Everything a worker thread owns, indexed by thread id. Handing these out
/// as `&mut` is what keeps the hot loop free of locks and allocation.
pub struct WorkerState {
    sampler: AliasSampler,
    subsample_rng: StdRng,
    window_rng: StdRng,
    /// Context mean in CBOW, accumulated center update in SG.
    avg: Vec<real>,
    /// Accumulated context gradient in CBOW.
    grad: Vec<real>,
    /// Reusable buffer for the subsampled sentence.
    kept: Sentence,
}

/// Applies embedding updates against a pair of shared tables. `table` holds
/// the vectors reported as output (context side in CBOW, center side in SG);
/// `ctx` holds the opposite role plus the negative targets.
pub struct Trainer<'a> {
    params: Params,
    filter_probs: Vec<real>,
    table: &'a Table,
    ctx: &'a Table,
}

impl<'a> Trainer<'a> {
    pub fn new(params: Params, table: &'a Table, ctx: &'a Table, filter_probs: Vec<real>) -> Self {
        Trainer {
            params,
            filter_probs,
            table,
            ctx,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Build the arena of per-thread records: one alias sampler over
    /// `neg_probs` and two uniform PRNGs each, seeded deterministically and
    /// distinctly per thread id.
    pub fn worker_states(&self, neg_probs: &[real]) -> Result<Vec<WorkerState>> {
        (0..self.params.threads)
            .map(|tid| {
                Ok(WorkerState {
                    sampler: AliasSampler::new(neg_probs, SAMPLER_SEED + tid as u64)?,
                    subsample_rng: StdRng::seed_from_u64(GLOBAL_SEED + tid as u64),
                    window_rng: StdRng::seed_from_u64(WINDOW_SEED + tid as u64),
                    avg: vec![0.0; self.params.dim],
                    grad: vec![0.0; self.params.dim],
                    kept: Sentence::new(),
                })
            })
            .collect()
    }

    /// One CBOW update: predict the center word at `center` from the mean of
    /// the context embeddings in `[left, right)` (center excluded), then pull
    /// one negative batch. Center and negative rows in `ctx` are updated
    /// in-place during the sweep; the context rows in `table` receive a
    /// single combined update at the end. Returns the loss when `want_loss`,
    /// else 0.
    pub fn cbow_update(
        &self,
        sent: &[Word],
        center: usize,
        left: usize,
        right: usize,
        state: &mut WorkerState,
        lr: real,
        want_loss: bool,
    ) -> real {
        let dim = self.params.dim;
        let WorkerState {
            sampler, avg, grad, ..
        } = state;
        avg.fill(0.0);
        grad.fill(0.0);

        let mut contexts = 0usize;
        for i in (left..right).filter(|&i| i != center) {
            let row = self.table.row(sent[i]);
            for d in 0..dim {
                avg[d] += row[d].get();
            }
            contexts += 1;
        }
        if contexts == 0 {
            return 0.0;
        }
        let k = contexts as real;
        for d in 0..dim {
            avg[d] /= k;
        }

        let mut loss: real = 0.0;
        let center_word = self.ctx.row(sent[center]);

        // Positive target: forward, then backward if there is anything to do.
        let sig_pos = sigmoid(dot_cells(avg, center_word));
        if want_loss {
            loss -= sig_pos.max(MIN_SIGMOID_IN_LOSS).ln();
        }
        if sig_pos < 1.0 {
            let coef = (sig_pos - 1.0) * lr;
            let scale = if self.params.use_bad_update { coef } else { coef / k };
            for d in 0..dim {
                grad[d] += center_word[d].get() * scale;
            }
            for d in 0..dim {
                center_word[d].add(-(avg[d] * coef));
            }
        }

        for _ in 0..self.params.negatives {
            let random_word = sampler.sample() as Word;
            // A draw that hits the center's own token id would push the
            // center away from itself; skip it without a replacement draw.
            if random_word == sent[center] {
                continue;
            }
            let rw = self.ctx.row(random_word);
            let sig_neg = sigmoid(dot_cells(avg, rw));
            if want_loss {
                loss -= (1.0 - sig_neg).max(MIN_SIGMOID_IN_LOSS).ln();
            }
            if sig_neg > 0.0 {
                let coef = sig_neg * lr;
                let scale = if self.params.use_bad_update { coef } else { coef / k };
                for d in 0..dim {
                    grad[d] += rw[d].get() * scale;
                }
                for d in 0..dim {
                    rw[d].add(-(avg[d] * coef));
                }
            }
        }

        for i in (left..right).filter(|&i| i != center) {
            let row = self.table.row(sent[i]);
            for d in 0..dim {
                row[d].add(-grad[d]);
            }
        }

        loss
    }

    /// One skip-gram update: predict each context word in `[left, right)`
    /// (center excluded) from the center embedding, with negatives per
    /// target. Target and negative rows in `ctx` update in-place; the center
    /// row in `table` accumulates into scratch and updates once at the end.
    /// Unlike CBOW, a negative draw equal to the center is kept: it touches a
    /// row in the other table, so there is nothing to protect.
    pub fn sg_update(
        &self,
        sent: &[Word],
        center: usize,
        left: usize,
        right: usize,
        state: &mut WorkerState,
        lr: real,
        want_loss: bool,
    ) -> real {
        let dim = self.params.dim;
        let WorkerState {
            sampler, avg: du, ..
        } = state;
        du.fill(0.0);

        let mut loss: real = 0.0;
        let center_word = self.table.row(sent[center]);

        for t in (left..right).filter(|&t| t != center) {
            let target = self.ctx.row(sent[t]);
            let sig_pos = sigmoid(dot_rows(center_word, target));
            if want_loss {
                loss -= sig_pos.max(MIN_SIGMOID_IN_LOSS).ln();
            }
            if sig_pos < 1.0 {
                let coef = (sig_pos - 1.0) * lr;
                for d in 0..dim {
                    du[d] -= target[d].get() * coef;
                }
                for d in 0..dim {
                    target[d].add(-(center_word[d].get() * coef));
                }
            }

            for _ in 0..self.params.negatives {
                let random_word = sampler.sample() as Word;
                let rw = self.ctx.row(random_word);
                let sig_neg = sigmoid(dot_rows(center_word, rw));
                if want_loss {
                    loss -= (1.0 - sig_neg).max(MIN_SIGMOID_IN_LOSS).ln();
                }
                if sig_neg > 0.0 {
                    let coef = sig_neg * lr;
                    for d in 0..dim {
                        du[d] -= rw[d].get() * coef;
                    }
                    for d in 0..dim {
                        rw[d].add(-(center_word[d].get() * coef));
                    }
                }
            }
        }

        // du is already a descent direction, hence +=.
        for d in 0..dim {
            center_word[d].add(du[d]);
        }

        loss
    }

    /// Process a whole sentence: subsample frequent tokens, then treat each
    /// retained token as a center with a freshly drawn one-sided window
    /// half-width in [1, ctxs]. Returns the retained token count.
    pub fn train_sentence(
        &self,
        raw: &[Word],
        state: &mut WorkerState,
        lr: real,
        cbow: bool,
    ) -> usize {
        let mut kept = std::mem::take(&mut state.kept);
        kept.clear();
        kept.reserve(raw.len());
        for &w in raw {
            let r: real = state.subsample_rng.gen_range(0.0..1.0);
            if r >= self.filter_probs[w as usize] {
                kept.push(w);
            }
        }

        for center in 0..kept.len() {
            let k = state.window_rng.gen_range(1..=self.params.ctxs);
            let left = center.saturating_sub(k);
            let right = (center + k + 1).min(kept.len());
            if cbow {
                self.cbow_update(&kept, center, left, right, state, lr, false);
            } else {
                self.sg_update(&kept, center, left, right, state, lr, false);
            }
        }

        let retained = kept.len();
        state.kept = kept;
        retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;

    fn fixed_tables(words: usize, dim: usize) -> (Table, Table) {
        let table = Table::zeros(words, dim);
        let ctx = Table::zeros(words, dim);
        let mut rng = StdRng::seed_from_u64(5);
        for w in 0..words as Word {
            for cell in table.row(w).iter().chain(ctx.row(w)) {
                cell.set(rng.gen_range(-0.5..0.5));
            }
        }
        (table, ctx)
    }

    fn params(dim: usize) -> Params {
        Params {
            dim,
            ctxs: 3,
            negatives: 2,
            threads: 1,
            use_bad_update: false,
        }
    }

    fn snapshot(table: &Table) -> Vec<real> {
        (0..table.words() as Word)
            .flat_map(|w| table.row(w).iter().map(Cell::get).collect::<Vec<_>>())
            .collect()
    }

    #[test]
    fn cbow_with_no_context_is_a_noop() {
        let (table, ctx) = fixed_tables(4, 3);
        let trainer = Trainer::new(params(3), &table, &ctx, vec![0.0; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let before = (snapshot(&table), snapshot(&ctx));
        let loss = trainer.cbow_update(&[0, 1, 2], 1, 1, 2, &mut states[0], 0.1, true);
        assert_eq!(loss, 0.0);
        assert_eq!((snapshot(&table), snapshot(&ctx)), before);
    }

    #[test]
    fn cbow_moves_center_and_context_rows() {
        let (table, ctx) = fixed_tables(4, 3);
        let trainer = Trainer::new(params(3), &table, &ctx, vec![0.0; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let table_before = snapshot(&table);
        let ctx_before = snapshot(&ctx);
        let loss = trainer.cbow_update(&[0, 1, 2], 1, 0, 3, &mut states[0], 0.1, true);
        assert!(loss > 0.0);
        assert_ne!(snapshot(&table), table_before);
        assert_ne!(snapshot(&ctx), ctx_before);
        // Word 3 is no-one's context, so its input row is untouched.
        let dim = 3;
        assert_eq!(snapshot(&table)[3 * dim..], table_before[3 * dim..]);
    }

    #[test]
    fn bad_update_mode_changes_the_context_step() {
        let run = |bad: bool| {
            let (table, ctx) = fixed_tables(4, 3);
            let mut p = params(3);
            p.use_bad_update = bad;
            let trainer = Trainer::new(p, &table, &ctx, vec![0.0; 4]);
            let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
            trainer.cbow_update(&[0, 1, 2], 1, 0, 3, &mut states[0], 0.1, false);
            snapshot(&table)
        };
        assert_ne!(run(false), run(true));
    }

    #[test]
    fn sg_moves_center_and_target_rows() {
        let (table, ctx) = fixed_tables(4, 3);
        let trainer = Trainer::new(params(3), &table, &ctx, vec![0.0; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let table_before = snapshot(&table);
        let loss = trainer.sg_update(&[0, 1], 0, 0, 2, &mut states[0], 0.1, true);
        assert!(loss > 0.0);
        let table_after = snapshot(&table);
        let dim = 3;
        // Only the center's input row moves on the table side.
        assert_ne!(table_after[..dim], table_before[..dim]);
        assert_eq!(table_after[dim..], table_before[dim..]);
    }

    #[test]
    fn subsampling_keeps_everything_at_zero_probability() {
        let (table, ctx) = fixed_tables(4, 3);
        let trainer = Trainer::new(params(3), &table, &ctx, vec![0.0; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let sent = vec![0, 1, 2, 3, 1];
        assert_eq!(trainer.train_sentence(&sent, &mut states[0], 0.05, true), 5);
    }

    #[test]
    fn subsampling_drops_everything_at_probability_one() {
        let (table, ctx) = fixed_tables(4, 3);
        let trainer = Trainer::new(params(3), &table, &ctx, vec![1.5; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let before = (snapshot(&table), snapshot(&ctx));
        assert_eq!(trainer.train_sentence(&[0, 1, 2], &mut states[0], 0.05, true), 0);
        assert_eq!((snapshot(&table), snapshot(&ctx)), before);
    }

    #[test]
    fn worker_states_are_distinct_per_thread() {
        let (table, ctx) = fixed_tables(4, 3);
        let mut p = params(3);
        p.threads = 2;
        let trainer = Trainer::new(p, &table, &ctx, vec![0.0; 4]);
        let mut states = trainer.worker_states(&[0.25; 4]).unwrap();
        let (a, b) = states.split_at_mut(1);
        let draws_a: Vec<usize> = (0..32).map(|_| a[0].sampler.sample()).collect();
        let draws_b: Vec<usize> = (0..32).map(|_| b[0].sampler.sample()).collect();
        assert_ne!(draws_a, draws_b);
    }
}
