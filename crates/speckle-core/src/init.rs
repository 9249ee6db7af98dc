//! Formulated initial object guess.
//!
//! By Parseval, a window whose transmittance has constant magnitude `|o|`
//! produces a diffraction frame with `‖y_j‖ = |o| ‖P‖`. Each window is
//! therefore assigned the real constant `‖y_j‖ / ‖P‖`, overlapping windows
//! are averaged, and pixels outside every window take the mean of the
//! covered ones.

use ndarray::{Array2, Array3};
use num_complex::Complex64;

use crate::patch::{accumulate, PatchIndexMap};
use crate::types::MeasurementSet;

pub fn formulated_initial_guess(
    measurements: &MeasurementSet,
    map: &PatchIndexMap,
    probe: &Array2<Complex64>,
) -> Array2<Complex64> {
    let probe_norm = probe.iter().map(|p| p.norm_sqr()).sum::<f64>().sqrt();
    let (m, n) = map.probe_shape();
    let mut patches = Array3::<Complex64>::zeros((map.len(), m, n));
    for (j, mut patch) in patches.outer_iter_mut().enumerate() {
        let frame_norm = measurements
            .amplitude(j)
            .iter()
            .map(|y| y * y)
            .sum::<f64>()
            .sqrt();
        let level = if probe_norm > 0.0 { frame_norm / probe_norm } else { 0.0 };
        patch.fill(Complex64::new(level, 0.0));
    }

    let (sum, weight) = accumulate(&patches, map, None);
    let covered: Vec<f64> = sum
        .iter()
        .zip(weight.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(s, &w)| s.re / w)
        .collect();
    let fill = if covered.is_empty() {
        0.0
    } else {
        covered.iter().sum::<f64>() / covered.len() as f64
    };

    let mut init = Array2::from_elem(map.object_shape(), Complex64::new(fill, 0.0));
    ndarray::Zip::from(&mut init)
        .and(&sum)
        .and(&weight)
        .for_each(|o, s, &w| {
            if w > 0.0 {
                *o = *s / w;
            }
        });
    init
}
