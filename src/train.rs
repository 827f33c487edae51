//! Epoch loop: pulls batches from a reader, schedules the learning rate, and
//! fans sentences out across the worker threads.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::parallel::{parallel_for, parallel_for_partitioned};
use crate::reader::Reader;
use crate::table::Cell;
use crate::trainer::{Trainer, WorkerState};
use crate::{real, Sentences};

/// Seed for the optional in-batch sentence shuffle.
const SHUFFLE_SEED: u64 = 12345;

/// Loop-level knobs; the update kernels have their own record
/// ([`crate::trainer::Params`]).
#[derive(Clone, Copy, Debug)]
pub struct Schedule {
    pub epochs: usize,
    pub init_lr: real,
    pub min_lr: real,
    /// Shuffle each batch's dispatch order before fanning out.
    pub shuffle: bool,
    /// Use the partitioned runner instead of the atomic one.
    pub partitioned: bool,
    /// Schedule the learning rate as if training started at this epoch.
    pub start_epoch: usize,
    /// Horizon of the linear learning-rate schedule, in epochs.
    pub max_schedule_epochs: usize,
    /// Total sentences per pass; 0 = unknown, which disables the linear
    /// schedule (constant `init_lr`) and the bounded progress bar.
    pub total_sentences: u64,
    pub show_progress: bool,
}

/// Run the full training schedule. Returns the total number of tokens
/// trained on (after subsampling) across all epochs.
pub fn run(
    trainer: &Trainer,
    states: &mut [WorkerState],
    reader: &mut dyn Reader,
    sched: &Schedule,
    cbow: bool,
) -> Result<u64> {
    let mut shuffle_rng = StdRng::seed_from_u64(SHUFFLE_SEED);
    let total_tokens = AtomicU64::new(0);
    let curr_lr = Cell::default();
    let mut sentences = Sentences::new();

    for epoch in 0..sched.epochs {
        let kept_in_epoch = AtomicU64::new(0);
        let raw_in_epoch = AtomicU64::new(0);
        let mut global_i: u64 = 0;

        println!("Epoch {epoch}");
        let bar = progress_bar(sched);

        while reader.next_batch(&mut sentences)? {
            let batch_len = sentences.len();
            let mut perm: Vec<usize> = (0..batch_len).collect();
            if sched.shuffle {
                perm.shuffle(&mut shuffle_rng);
            }

            let work = |i: usize, _tid: usize, state: &mut WorkerState| {
                let sent = &sentences[perm[i]];

                // Linear learning-rate schedule over the whole run, by
                // sentence position within the (possibly extended) horizon.
                let mut lr = sched.init_lr;
                if sched.total_sentences > 0 {
                    let progress = ((epoch + sched.start_epoch) as real
                        + (i as u64 + global_i) as real / sched.total_sentences as real)
                        / sched.max_schedule_epochs as real;
                    lr = sched.init_lr - (sched.init_lr - sched.min_lr) * progress;
                }
                curr_lr.set(lr);

                let kept = trainer.train_sentence(sent, state, lr, cbow);
                kept_in_epoch.fetch_add(kept as u64, Ordering::Relaxed);
                raw_in_epoch.fetch_add(sent.len() as u64, Ordering::Relaxed);
                total_tokens.fetch_add(kept as u64, Ordering::Relaxed);
            };

            if sched.partitioned {
                parallel_for_partitioned(0, batch_len, states, work);
            } else {
                parallel_for(0, batch_len, states, work);
            }

            global_i += batch_len as u64;
            if let Some(bar) = &bar {
                let pos = if sched.total_sentences > 0 {
                    global_i.min(sched.total_sentences)
                } else {
                    global_i
                };
                bar.set_position(pos);
                bar.set_message(format!("lr {:.5}", curr_lr.get()));
            }
        }

        if let Some(bar) = &bar {
            bar.finish();
        }
        let kept = kept_in_epoch.load(Ordering::Relaxed);
        let raw = raw_in_epoch.load(Ordering::Relaxed);
        if raw > 0 {
            println!(
                "{:.2}% of tokens were retained while filtering.",
                100.0 * kept as f64 / raw as f64
            );
        }
    }

    Ok(total_tokens.into_inner())
}

fn progress_bar(sched: &Schedule) -> Option<ProgressBar> {
    if !sched.show_progress {
        return None;
    }
    let bar = if sched.total_sentences > 0 {
        let bar = ProgressBar::new(sched.total_sentences);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} sents {msg}",
            )
            .unwrap(),
        );
        bar
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {pos} sents ({per_sec}) {msg}")
                .unwrap(),
        );
        bar
    };
    Some(bar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{LineParser, OnceReader, ReadMode};
    use crate::table::Table;
    use crate::trainer::Params;
    use crate::vocab::IndexMap;
    use std::collections::HashMap;
    use std::fs::File;
    use std::io::Write as _;
    use std::sync::Arc;

    #[test]
    fn counts_trained_tokens_across_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt");
        writeln!(File::create(&path).unwrap(), "a b c\nc b").unwrap();

        let mut vocab = IndexMap::default();
        for w in ["a", "b", "c"] {
            vocab.insert(w);
        }
        let vocab = Arc::new(vocab);

        let table = Table::zeros(3, 4);
        let ctx = Table::zeros(3, 4);
        crate::table::init_tables(&table, &ctx, &vocab, &HashMap::new(), 1);

        let params = Params {
            dim: 4,
            ctxs: 2,
            negatives: 2,
            threads: 2,
            use_bad_update: false,
        };
        let trainer = Trainer::new(params, &table, &ctx, vec![0.0; 3]);
        let mut states = trainer.worker_states(&[1.0 / 3.0; 3]).unwrap();

        let parser = LineParser::new(vocab, true).unwrap();
        let mut reader = OnceReader::new(parser, vec![path], ReadMode::Auto, false);

        let sched = Schedule {
            epochs: 3,
            init_lr: 0.025,
            min_lr: 1e-4,
            shuffle: true,
            partitioned: false,
            start_epoch: 0,
            max_schedule_epochs: 3,
            total_sentences: 2,
            show_progress: false,
        };
        let tokens = run(&trainer, &mut states, &mut reader, &sched, true).unwrap();
        // Nothing is subsampled away, so every epoch trains on all 5 tokens.
        assert_eq!(tokens, 15);
    }
}
