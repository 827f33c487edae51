//! Per-word probabilities derived from vocabulary counts: the chance of
//! discarding an occurrence of a frequent word, and the smoothed unigram
//! distribution negatives are drawn from.

use crate::real;

/// Probability of discarding each occurrence of word `w`:
/// `1 - sqrt(t/r_w) - t/r_w` with `r_w` the relative frequency and `t` the
/// downsample threshold. Entries at or below zero mean "never discard"; the
/// keep test `uniform >= filter_probs[w]` then always passes (a zero count
/// yields -inf and behaves the same way).
pub fn subsample_probs(counts: &[u64], threshold: real) -> Vec<real> {
    let total: u64 = counts.iter().sum();
    let t = threshold as f64;
    counts
        .iter()
        .map(|&count| {
            let r = count as f64 / total as f64;
            (1.0 - (t / r).sqrt() - t / r) as real
        })
        .collect()
}

/// Negative-sampling distribution: proportional to `count^ns_exponent`,
/// normalized to sum to 1.
pub fn negative_sampling_probs(counts: &[u64], ns_exponent: real) -> Vec<real> {
    let powered: Vec<f64> = counts
        .iter()
        .map(|&count| (count as f64).powf(ns_exponent as f64))
        .collect();
    let total: f64 = powered.iter().sum();
    powered.iter().map(|&a| (a / total) as real).collect()
}
