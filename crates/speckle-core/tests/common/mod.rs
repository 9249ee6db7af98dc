//! Synthetic fixtures shared by the integration tests.

#![allow(dead_code)]

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use speckle_core::init::formulated_initial_guess;
use speckle_core::patch::PatchIndexMap;
use speckle_core::prior::IdentityDenoiser;
use speckle_core::propagation::Propagator;
use speckle_core::solver::epie::{EpieParams, EpieSolver};
use speckle_core::solver::pmace::{PmaceParams, PmaceSolver, RegParams};
use speckle_core::solver::sharp::{SharpParams, SharpSolver};
use speckle_core::solver::wf::{WfParams, WfSolver};
use speckle_core::solver::PtychoSolver;
use speckle_core::types::{MeasurementSet, PtychoProblem, ReferenceImages};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Gaussian envelope with a mild linear phase ramp.
pub fn gaussian_probe(size: usize, sigma: f64) -> Array2<Complex64> {
    let centre = (size as f64 - 1.0) / 2.0;
    Array2::from_shape_fn((size, size), |(r, c)| {
        let (dr, dc) = (r as f64 - centre, c as f64 - centre);
        let amplitude = (-(dr * dr + dc * dc) / (2.0 * sigma * sigma)).exp();
        Complex64::from_polar(amplitude, 0.2 * dc)
    })
}

/// Square grid of windows with the given step, starting at the origin.
pub fn grid_map(grid: usize, step: usize, probe_size: usize) -> PatchIndexMap {
    let extent = (grid - 1) * step + probe_size;
    let mut coords = Vec::with_capacity(grid * grid);
    for gr in 0..grid {
        for gc in 0..grid {
            let (r0, c0) = ((gr * step) as i64, (gc * step) as i64);
            coords.push([r0, r0 + probe_size as i64, c0, c0 + probe_size as i64]);
        }
    }
    PatchIndexMap::from_coords(&coords, (probe_size, probe_size), (extent, extent))
        .expect("grid windows fit the object")
}

/// Noiseless amplitudes `|F(P · O_j)|` for every window.
pub fn simulate(object: &Array2<Complex64>, probe: &Array2<Complex64>, map: &PatchIndexMap) -> MeasurementSet {
    let propagator = Propagator::new(map.probe_shape());
    let (m, n) = map.probe_shape();
    let mut amplitudes = Array3::<f64>::zeros((map.len(), m, n));
    for (window, mut frame) in map.windows().iter().zip(amplitudes.axis_iter_mut(Axis(0))) {
        let exit_wave = &window.view(object) * probe;
        frame.assign(&propagator.forward(&exit_wave).mapv(|s| s.norm()));
    }
    MeasurementSet::from_amplitudes(amplitudes).expect("simulated amplitudes are valid")
}

/// Smoothly varying weak-phase transmittance.
pub fn smooth_object(size: usize) -> Array2<Complex64> {
    let k = 2.0 * PI / size as f64;
    Array2::from_shape_fn((size, size), |(r, c)| {
        let magnitude = 0.9 + 0.1 * (k * r as f64).cos();
        let phase = 0.3 * (k * c as f64).sin();
        Complex64::from_polar(magnitude, phase)
    })
}

/// `truth` plus seeded complex noise of the given amplitude.
pub fn perturbed(truth: &Array2<Complex64>, amount: f64, seed: u64) -> Array2<Complex64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    truth.mapv(|t| {
        t + Complex64::new(
            amount * rng.gen_range(-1.0..1.0),
            amount * rng.gen_range(-1.0..1.0),
        )
    })
}

fn with_truth(problem: PtychoProblem, truth: &Array2<Complex64>) -> PtychoProblem {
    problem
        .with_reference(ReferenceImages {
            object: Some(truth.clone()),
            probe: None,
            window: None,
        })
        .expect("reference matches the object shape")
}

/// 8x8 unit object, 4x4 Gaussian probe, four windows tiling the object,
/// starting from the formulated initial guess.
pub fn reference_scenario() -> PtychoProblem {
    let truth = Array2::from_elem((8, 8), Complex64::new(1.0, 0.0));
    let probe = gaussian_probe(4, 2.0);
    let map = grid_map(2, 4, 4);
    let measurements = simulate(&truth, &probe, &map);
    let init = formulated_initial_guess(&measurements, &map, &probe);
    let problem = PtychoProblem::new(measurements, map, probe, init).expect("consistent shapes");
    with_truth(problem, &truth)
}

/// 3x3 grid of 4x4 windows with step 2 on an 8x8 smooth object.
pub fn overlapping_scenario(init: impl FnOnce(&Array2<Complex64>) -> Array2<Complex64>) -> PtychoProblem {
    let truth = smooth_object(8);
    let probe = gaussian_probe(4, 2.0);
    let map = grid_map(3, 2, 4);
    let measurements = simulate(&truth, &probe, &map);
    let problem = PtychoProblem::new(measurements, map, probe, init(&truth)).expect("consistent shapes");
    with_truth(problem, &truth)
}

/// One solver of every method, all with the same iteration budget.
pub fn all_solvers(num_iter: usize) -> Vec<Box<dyn PtychoSolver>> {
    vec![
        Box::new(EpieSolver::new(EpieParams {
            num_iter,
            seed: Some(3),
            ..Default::default()
        })),
        Box::new(WfSolver::new(WfParams {
            num_iter,
            ..Default::default()
        })),
        Box::new(WfSolver::accelerated(WfParams {
            num_iter,
            ..Default::default()
        })),
        Box::new(SharpSolver::new(SharpParams {
            num_iter,
            ..Default::default()
        })),
        Box::new(SharpSolver::plus(SharpParams {
            num_iter,
            ..Default::default()
        })),
        Box::new(PmaceSolver::new(PmaceParams {
            num_iter,
            ..Default::default()
        })),
        Box::new(
            PmaceSolver::new(PmaceParams {
                num_iter,
                reg: Some(RegParams::default()),
                ..Default::default()
            })
            .with_denoiser(Arc::new(IdentityDenoiser)),
        ),
    ]
}

pub fn max_abs_diff(a: &Array2<Complex64>, b: &Array2<Complex64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}
