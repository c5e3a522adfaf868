//! Technical indicator library.
//!
//! Every function is pure over `(inputs, params)` and returns one output
//! value per input bar. Bars inside the warm-up window produce `f64::NAN`;
//! an empty input yields an empty output. Nothing here allocates global
//! state, so the same call with the same inputs always agrees.

mod levels;
mod moving;
mod oscillators;
mod stats;
mod trend;
mod volatility;
mod volume;

pub use levels::*;
pub use moving::*;
pub use oscillators::*;
pub use stats::*;
pub use trend::*;
pub use volatility::*;
pub use volume::*;

pub(crate) fn nan_vec(len: usize) -> Vec<f64> {
    vec![f64::NAN; len]
}

/// True when a window of `period` bars ending at `i` fits in `len` bars.
pub(crate) fn warm(i: usize, period: usize) -> bool {
    i + 1 >= period
}
