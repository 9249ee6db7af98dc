//! Data-fitting projection onto the measured Fourier magnitude.
//!
//! For an exit wave $\psi$ and measured amplitude $y$:
//!
//! $$
//! \Pi_y(\psi) = \mathcal{F}^{-1}\left[ y \, e^{i \arg \mathcal{F}\psi} \right]
//! $$
//!
//! This is the only place the recorded data enters any solver. The phase is
//! taken with `arg`, which is defined (as zero) on empty spectral bins, so no
//! division by the spectral magnitude is needed.

use ndarray::{Array2, ArrayBase, Data, Ix2, Zip};
use num_complex::Complex64;

use crate::propagation::Propagator;

/// Replace the Fourier magnitude of `field` with `amplitude`, keeping its phase.
pub fn project_magnitude<S, T>(
    propagator: &Propagator,
    field: &ArrayBase<S, Ix2>,
    amplitude: &ArrayBase<T, Ix2>,
) -> Array2<Complex64>
where
    S: Data<Elem = Complex64>,
    T: Data<Elem = f64>,
{
    assert_eq!(
        field.dim(),
        amplitude.dim(),
        "measured amplitude must match the field shape"
    );
    let mut spectrum = propagator.forward(field);
    Zip::from(&mut spectrum)
        .and(amplitude)
        .for_each(|s, &y| *s = Complex64::from_polar(y, s.arg()));
    propagator.inverse(&spectrum)
}

/// Fourier-domain misfit `Σ (|F ψ| - y)²` of one exit wave.
pub fn magnitude_misfit<S, T>(
    propagator: &Propagator,
    field: &ArrayBase<S, Ix2>,
    amplitude: &ArrayBase<T, Ix2>,
) -> f64
where
    S: Data<Elem = Complex64>,
    T: Data<Elem = f64>,
{
    let spectrum = propagator.forward(field);
    Zip::from(&spectrum)
        .and(amplitude)
        .fold(0.0, |acc, s, &y| acc + (s.norm() - y).powi(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_projected_field_has_measured_magnitude() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let prop = Propagator::new((5, 4));
        let field = Array2::from_shape_fn((5, 4), |_| {
            Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
        });
        let amplitude = Array2::from_shape_fn((5, 4), |_| rng.gen_range(0.0..3.0));
        let projected = project_magnitude(&prop, &field, &amplitude);
        let spectrum = prop.forward(&projected);
        for (s, y) in spectrum.iter().zip(amplitude.iter()) {
            assert_relative_eq!(s.norm(), *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_projection_keeps_spectral_phase() {
        let prop = Propagator::new((4, 4));
        let field = Array2::from_shape_fn((4, 4), |(r, c)| {
            Complex64::from_polar(1.0 + r as f64, 0.3 * c as f64)
        });
        let amplitude = Array2::from_elem((4, 4), 2.0);
        let before = prop.forward(&field);
        let after = prop.forward(&project_magnitude(&prop, &field, &amplitude));
        for (b, a) in before.iter().zip(after.iter()) {
            if b.norm() > 1e-9 {
                assert!((b.arg() - a.arg()).abs() < 1e-9 || (b.arg() - a.arg()).abs() > 6.28);
            }
        }
    }

    #[test]
    fn test_consistent_field_is_fixed_point() {
        let prop = Propagator::new((4, 4));
        let field = Array2::from_shape_fn((4, 4), |(r, c)| {
            Complex64::new(0.5 + 0.1 * r as f64, -0.2 * c as f64)
        });
        let amplitude = prop.forward(&field).mapv(|s| s.norm());
        let projected = project_magnitude(&prop, &field, &amplitude);
        for (p, f) in projected.iter().zip(field.iter()) {
            assert!((p - f).norm() < 1e-12);
        }
        assert!(magnitude_misfit(&prop, &field, &amplitude) < 1e-24);
    }

    #[test]
    fn test_zero_field_projects_to_real_spectrum() {
        // arg(0) = 0, so an empty spectrum takes the measured amplitude with zero phase.
        let prop = Propagator::new((2, 2));
        let field = Array2::<Complex64>::zeros((2, 2));
        let amplitude = Array2::from_elem((2, 2), 1.0);
        let projected = project_magnitude(&prop, &field, &amplitude);
        assert!(projected.iter().all(|v| v.is_finite()));
        let spectrum = prop.forward(&projected);
        for s in spectrum.iter() {
            assert_relative_eq!(s.re, 1.0, epsilon = 1e-12);
        }
    }
}
