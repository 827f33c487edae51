//! Constant-time sampling from a fixed categorical distribution.
//!
//! Implements Vose's alias method as described in
//! <https://www.keithschwarz.com/darts-dice-coins/>. Negative-sampling draws
//! sit in the innermost training loop, so each worker thread owns one sampler
//! with its own small PRNG.

use anyhow::{ensure, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::real;

pub struct AliasSampler {
    /// Alias class for each bucket.
    alias: Vec<usize>,
    /// Threshold for keeping the bucket instead of its alias.
    threshold: Vec<real>,
    rng: SmallRng,
    n: usize,
}

impl AliasSampler {
    /// Build the alias table for `probs`, which must be a valid distribution:
    /// non-empty, no negative (or NaN) entries, sum within 1e-4 of 1.
    pub fn new(probs: &[real], seed: u64) -> Result<AliasSampler> {
        ensure!(!probs.is_empty(), "cannot sample from an empty distribution");
        ensure!(
            probs.iter().all(|&p| p >= 0.0),
            "sampling distribution has negative entries"
        );
        let sum: f64 = probs.iter().map(|&p| p as f64).sum();
        ensure!(
            (0.9999..=1.0001).contains(&sum),
            "sampling distribution sums to {sum}, not 1"
        );

        let n = probs.len();
        let mut alias = vec![0usize; n];
        let mut threshold = vec![0.0; n];

        let mut scaled: Vec<real> = probs.iter().map(|&p| p * n as real).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, &s) in scaled.iter().enumerate() {
            if s < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(&l), Some(&g)) = (small.last(), large.last()) {
            small.pop();
            large.pop();
            threshold[l] = scaled[l];
            alias[l] = g;
            scaled[g] = (scaled[g] + scaled[l]) - 1.0;
            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }
        // Whichever worklist is left holds buckets that always keep themselves.
        for i in large.into_iter().chain(small) {
            threshold[i] = 1.0;
        }

        Ok(AliasSampler {
            alias,
            threshold,
            rng: SmallRng::seed_from_u64(seed),
            n,
        })
    }

    /// Draw an index in `[0, n)` distributed according to the construction
    /// probabilities. O(1): one bucket pick and one coin flip.
    pub fn sample(&mut self) -> usize {
        let bucket = self.rng.gen_range(0..self.n);
        let r: real = self.rng.gen_range(0.0..1.0);
        if r <= self.threshold[bucket] {
            bucket
        } else {
            self.alias[bucket]
        }
    }

    pub fn num_classes(&self) -> usize {
        self.n
    }
}
