//! Far-field propagation between real-space exit waves and diffraction
//! amplitudes.
//!
//! The detector is modelled as the unitary 2D discrete Fourier transform of
//! the exit wave $\psi = P \cdot O_j$:
//!
//! $$
//! \hat\psi(k) = \frac{1}{\sqrt{mn}} \sum_{r} \psi(r)\, e^{-2\pi i k \cdot r}
//! $$
//!
//! Unitarity keeps the real-space and Fourier-space residuals on the same
//! scale, which the gradient and proximal step sizes rely on.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, ArrayBase, Data, Ix2};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

/// Planned forward and inverse transforms for one frame shape.
///
/// Plans are shared behind `Arc`, so a propagator is cheap to clone and may
/// be used from several threads at once.
#[derive(Clone)]
pub struct Propagator {
    shape: (usize, usize),
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
    scale: f64,
}

impl fmt::Debug for Propagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagator")
            .field("shape", &self.shape)
            .finish()
    }
}

impl Propagator {
    /// Plan transforms for frames of shape `(rows, cols)`.
    pub fn new(shape: (usize, usize)) -> Self {
        let (rows, cols) = shape;
        let mut planner = FftPlanner::<f64>::new();
        Self {
            shape,
            row_forward: planner.plan_fft_forward(cols),
            row_inverse: planner.plan_fft_inverse(cols),
            col_forward: planner.plan_fft_forward(rows),
            col_inverse: planner.plan_fft_inverse(rows),
            scale: 1.0 / ((rows * cols) as f64).sqrt(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Real-space field to far-field spectrum.
    pub fn forward<S>(&self, field: &ArrayBase<S, Ix2>) -> Array2<Complex64>
    where
        S: Data<Elem = Complex64>,
    {
        self.transform(field, &self.row_forward, &self.col_forward)
    }

    /// Far-field spectrum back to real space. Exact inverse of [`forward`](Self::forward).
    pub fn inverse<S>(&self, spectrum: &ArrayBase<S, Ix2>) -> Array2<Complex64>
    where
        S: Data<Elem = Complex64>,
    {
        self.transform(spectrum, &self.row_inverse, &self.col_inverse)
    }

    fn transform<S>(
        &self,
        input: &ArrayBase<S, Ix2>,
        row_fft: &Arc<dyn Fft<f64>>,
        col_fft: &Arc<dyn Fft<f64>>,
    ) -> Array2<Complex64>
    where
        S: Data<Elem = Complex64>,
    {
        assert_eq!(
            input.dim(),
            self.shape,
            "field shape must match the propagator shape"
        );
        let (rows, cols) = self.shape;

        // Row transforms: the buffer holds `rows` contiguous chunks of length `cols`.
        let mut by_row: Vec<Complex64> = input.iter().copied().collect();
        row_fft.process(&mut by_row);

        // Column transforms on the transposed buffer.
        let mut by_col = Vec::with_capacity(rows * cols);
        for c in 0..cols {
            for r in 0..rows {
                by_col.push(by_row[r * cols + c]);
            }
        }
        col_fft.process(&mut by_col);

        let scale = self.scale;
        Array2::from_shape_fn(self.shape, |(r, c)| by_col[c * rows + r] * scale)
    }
}
