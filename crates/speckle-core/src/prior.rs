//! Regularisation priors for reg-PMACE.
//!
//! The consensus solver only needs a proximal map of the form
//! `apply(image, noise_std) -> image`. Any denoiser implementing
//! [`Denoiser`] can be plugged in; [`PriorModel`] selects one of the built-in
//! priors from configuration.

use std::sync::Arc;

use ndarray::{Array2, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// A denoiser used as the regularisation proximal map.
pub trait Denoiser: Send + Sync {
    /// Denoise `image` assuming additive noise of standard deviation `noise_std`.
    fn apply(&self, image: &Array2<Complex64>, noise_std: f64) -> Array2<Complex64>;

    fn name(&self) -> &str;
}

/// Built-in prior selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorModel {
    /// No regularisation; reg-PMACE reduces to PMACE.
    Identity,
    /// Separable Gaussian smoothing of the complex image.
    GaussianSmoothing { sigma: f64 },
}

impl Default for PriorModel {
    fn default() -> Self {
        PriorModel::GaussianSmoothing { sigma: 0.8 }
    }
}

impl PriorModel {
    pub fn denoiser(&self) -> Arc<dyn Denoiser> {
        match self {
            PriorModel::Identity => Arc::new(IdentityDenoiser),
            PriorModel::GaussianSmoothing { sigma } => Arc::new(GaussianSmoother::new(*sigma)),
        }
    }
}

/// Returns its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDenoiser;

impl Denoiser for IdentityDenoiser {
    fn apply(&self, image: &Array2<Complex64>, _noise_std: f64) -> Array2<Complex64> {
        image.clone()
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Noise level at which [`GaussianSmoother`] uses exactly its nominal width.
pub const REFERENCE_NOISE_STD: f64 = 0.02;

/// Gaussian low-pass filter applied to real and imaginary parts together.
///
/// The kernel width is `sigma * noise_std / REFERENCE_NOISE_STD`, capped at
/// the larger image dimension, so noisier data is smoothed harder.
/// Noise-free input (`noise_std <= 0`) is passed through untouched.
#[derive(Debug, Clone)]
pub struct GaussianSmoother {
    sigma: f64,
}

impl GaussianSmoother {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    /// Kernel width in pixels for `noise_std` on an image of extent `max_len`.
    pub fn width(&self, noise_std: f64, max_len: usize) -> f64 {
        if !(self.sigma > 0.0 && self.sigma.is_finite() && noise_std > 0.0 && noise_std.is_finite()) {
            return 0.0;
        }
        (self.sigma * noise_std / REFERENCE_NOISE_STD).min(max_len as f64)
    }
}

/// Normalised Gaussian taps out to three widths; a single tap when `width` is zero.
fn gaussian_kernel(width: f64) -> Vec<f64> {
    if width <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * width).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|k| (-(k * k) as f64 / (2.0 * width * width)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= total);
    kernel
}

fn convolve_axis(kernel: &[f64], image: &Array2<Complex64>, axis: Axis) -> Array2<Complex64> {
    let radius = (kernel.len() / 2) as i64;
    let len = image.len_of(axis) as i64;
    Array2::from_shape_fn(image.dim(), |(r, c)| {
        let centre = (if axis == Axis(0) { r } else { c }) as i64;
        kernel
            .iter()
            .enumerate()
            .map(|(k, &w)| {
                let idx = reflect(centre + k as i64 - radius, len);
                let v = if axis == Axis(0) { image[[idx, c]] } else { image[[r, idx]] };
                v * w
            })
            .sum()
    })
}

/// Mirror an index into `[0, len)` (edge pixel repeated).
fn reflect(idx: i64, len: i64) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * len;
    let mut i = idx.rem_euclid(period);
    if i >= len {
        i = period - 1 - i;
    }
    i as usize
}

impl Denoiser for GaussianSmoother {
    fn apply(&self, image: &Array2<Complex64>, noise_std: f64) -> Array2<Complex64> {
        let (rows, cols) = image.dim();
        let kernel = gaussian_kernel(self.width(noise_std, rows.max(cols)));
        if kernel.len() == 1 {
            return image.clone();
        }
        let smoothed = convolve_axis(&kernel, image, Axis(0));
        convolve_axis(&kernel, &smoothed, Axis(1))
    }

    fn name(&self) -> &str {
        "gaussian"
    }
}
