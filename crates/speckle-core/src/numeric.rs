//! Guarded division primitives and instability bookkeeping.
//!
//! Every solver divides by probe or patch magnitudes somewhere. Divisors
//! below a floor are clamped to it; the number of clamped divisions is
//! returned to the caller, which turns it into a
//! [`NumericalInstabilityWarning`]. A run never aborts because of this.

use ndarray::{Array2, ArrayBase, Data, Ix2, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Divisors smaller than this fraction of the largest divisor are floored.
pub const RELATIVE_FLOOR: f64 = 1e-10;

/// Absolute lower bound for any divisor.
pub const ABSOLUTE_FLOOR: f64 = 1e-30;

/// A division hit the magnitude floor (or saw a non-finite divisor).
///
/// The iteration carried on; error metrics from this iteration onward may be
/// unreliable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericalInstabilityWarning {
    /// Iteration (0-based) in which the division happened.
    pub iteration: usize,
    /// Which division, e.g. `"object step normaliser"`.
    pub site: String,
    /// Number of floored elements.
    pub count: usize,
}

/// Collects warnings for one run and forwards them to the log.
#[derive(Debug, Default)]
pub struct InstabilityLog {
    warnings: Vec<NumericalInstabilityWarning>,
}

impl InstabilityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` floored divisions at `site`. Zero counts are ignored.
    pub fn report(&mut self, iteration: usize, site: &str, count: usize) {
        if count == 0 {
            return;
        }
        log::warn!(
            "Numerical instability at iteration {}: {} floored division(s) in {}",
            iteration,
            count,
            site
        );
        match self
            .warnings
            .iter_mut()
            .find(|w| w.iteration == iteration && w.site == site)
        {
            Some(existing) => existing.count += count,
            None => self.warnings.push(NumericalInstabilityWarning {
                iteration,
                site: site.to_string(),
                count,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<NumericalInstabilityWarning> {
        self.warnings
    }
}

/// Per-pixel `sum / weight`.
///
/// Pixels with zero weight lie outside every window and take `fallback`.
/// Positive weights below the floor are clamped; NaN weights propagate.
/// Returns the quotient and the number of floored pixels.
pub fn weighted_average(
    sum: &Array2<Complex64>,
    weight: &Array2<f64>,
    fallback: &Array2<Complex64>,
) -> (Array2<Complex64>, usize) {
    let peak = weight
        .iter()
        .filter(|w| w.is_finite())
        .fold(0.0_f64, |m, &w| m.max(w));
    let floor = (peak * RELATIVE_FLOOR).max(ABSOLUTE_FLOOR);
    let mut floored = 0usize;
    let out = Zip::from(sum)
        .and(weight)
        .and(fallback)
        .map_collect(|&s, &w, &f| {
            if w == 0.0 {
                f
            } else if w.is_nan() {
                floored += 1;
                s / w
            } else if w < floor {
                floored += 1;
                s / floor
            } else {
                s / w
            }
        });
    (out, floored)
}

/// `1 / max|x|²`, floored. The flag is set when the floor was used.
pub fn inverse_peak_power<S>(x: &ArrayBase<S, Ix2>) -> (f64, bool)
where
    S: Data<Elem = Complex64>,
{
    let peak = x.iter().fold(0.0_f64, |m, v| m.max(v.norm_sqr()));
    inverse_floored(peak)
}

/// `1 / value`, floored at [`ABSOLUTE_FLOOR`]. The flag is set when the floor was used.
pub fn inverse_floored(value: f64) -> (f64, bool) {
    if value.is_finite() && value >= ABSOLUTE_FLOOR {
        (1.0 / value, false)
    } else {
        (1.0 / ABSOLUTE_FLOOR, true)
    }
}
