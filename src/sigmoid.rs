//! Logistic function at training precision.
//!
//! Computed as `tanh(x/2)/2 + 1/2` so the extremes come out as exactly 0 and
//! 1 instead of overflowing `exp`. The default build reads a precomputed
//! table on the hot path; the `grad-check` build evaluates `tanh` directly so
//! analytic gradients can be checked numerically.

use crate::real;

#[cfg(not(feature = "grad-check"))]
use std::sync::OnceLock;

/// Lower clamp applied to sigmoid outputs before taking a log in the loss.
/// Equal to the smallest non-zero entry of the lookup table.
pub const MIN_SIGMOID_IN_LOSS: real = 0.000340641;

/// Samples per unit of x in the lookup table.
#[cfg(not(feature = "grad-check"))]
const FACTOR: real = 64.0;
/// Half-width of the tabulated range; inputs are clamped to [-WINDOW, WINDOW].
#[cfg(not(feature = "grad-check"))]
const WINDOW: real = 8.0;
#[cfg(not(feature = "grad-check"))]
const TABLE_LEN: usize = 2 * 64 * 8 + 1;

/// σ(x), by table lookup in the default build.
#[cfg(not(feature = "grad-check"))]
pub fn sigmoid(x: real) -> real {
    static TABLE: OnceLock<[real; TABLE_LEN]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = [0.0; TABLE_LEN];
        for (i, entry) in table.iter_mut().enumerate() {
            let x = (i as real - FACTOR * WINDOW) / FACTOR;
            *entry = (x * 0.5).tanh().mul_add(0.5, 0.5);
        }
        table[0] = 0.0;
        table[TABLE_LEN - 1] = 1.0;
        table
    });
    table[x.clamp(-WINDOW, WINDOW).mul_add(FACTOR, FACTOR * WINDOW) as usize]
}

/// σ(x), exact. `tanh` handles the extremes on its own: tanh(±∞) = ±1.
#[cfg(feature = "grad-check")]
pub fn sigmoid(x: real) -> real {
    (x * 0.5).tanh().mul_add(0.5, 0.5)
}
