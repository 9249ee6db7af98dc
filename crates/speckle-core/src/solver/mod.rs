//! Reconstruction solver abstraction and implementations.
//!
//! The [`PtychoSolver`] trait defines the interface every iterative
//! phase-retrieval method implements. Four families are provided:
//!
//! - [`epie`]: sequential alternating update (ePIE), stochastic ordering.
//! - [`wf`]: batch Wirtinger-flow gradient descent, optionally accelerated.
//! - [`sharp`]: relaxed averaged projections (SHARP) and RAAR (SHARP+).
//! - [`pmace`]: consensus equilibrium with Mann averaging (PMACE, reg-PMACE).

pub mod epie;
pub mod pmace;
pub mod sharp;
pub mod wf;

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use speckle_compute::{ComputeBackend, ComputeError};
use thiserror::Error;

use crate::monitor::{IterationRecorder, NullRecorder};
use crate::numeric::weighted_average;
use crate::patch::{coverage_weight, scatter_add, PatchIndexMap};
use crate::types::{PtychoProblem, Reconstruction};

/// Errors that can occur while setting up or running a reconstruction.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Invalid scan geometry: {0}")]
    Geometry(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid measurement data: {0}")]
    InvalidMeasurement(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Compute backend error: {0}")]
    Compute(#[from] ComputeError),
}

/// The core trait that all reconstruction methods implement.
///
/// A run owns its object (and probe) estimate exclusively, executes exactly
/// the configured number of iterations and reports every iteration to
/// `recorder` once the estimate for that iteration is final.
pub trait PtychoSolver {
    /// Run the reconstruction, reporting each iteration to `recorder`.
    fn reconstruct(
        &self,
        problem: &PtychoProblem,
        recorder: &mut dyn IterationRecorder,
    ) -> Result<Reconstruction, ReconError>;

    /// Human-readable name of the method.
    fn method_name(&self) -> &str;

    /// Run the reconstruction without a recorder.
    fn solve(&self, problem: &PtychoProblem) -> Result<Reconstruction, ReconError> {
        self.reconstruct(problem, &mut NullRecorder)
    }
}

pub(crate) fn check_unit_interval(
    name: &'static str,
    value: f64,
    allow_zero: bool,
) -> Result<(), ReconError> {
    let lower_ok = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if lower_ok && value <= 1.0 {
        Ok(())
    } else {
        let range = if allow_zero { "[0, 1]" } else { "(0, 1]" };
        Err(ReconError::InvalidParameter {
            name,
            reason: format!("{value} is outside {range}"),
        })
    }
}

pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<(), ReconError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ReconError::InvalidParameter {
            name,
            reason: format!("{value} must be positive and finite"),
        })
    }
}

/// Strictly inside (0, 1).
pub(crate) fn check_open_unit_interval(name: &'static str, value: f64) -> Result<(), ReconError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ReconError::InvalidParameter {
            name,
            reason: format!("{value} is outside (0, 1)"),
        })
    }
}

pub(crate) fn check_non_negative(name: &'static str, value: f64) -> Result<(), ReconError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ReconError::InvalidParameter {
            name,
            reason: format!("{value} must be non-negative and finite"),
        })
    }
}

/// Fill a frame stack with `probe * object[window_j]` for every measurement.
pub(crate) fn illuminated_frames(
    backend: &dyn ComputeBackend,
    object: &Array2<Complex64>,
    probe: &Array2<Complex64>,
    map: &PatchIndexMap,
) -> Result<Array3<Complex64>, ReconError> {
    let frames = backend.fill_frames(map.len(), map.probe_shape(), &|j, mut out| {
        let patch = map.window(j).view(object);
        out.assign(&(&patch * probe));
    })?;
    Ok(frames)
}

/// Least-squares object consistent with a frame stack:
/// `Σ_j P_jᵀ conj(P) ψ_j / Σ_j P_jᵀ |P|²`.
///
/// Pixels outside every window keep their value from `fallback`. Returns the
/// object and the number of floored divisions.
pub(crate) fn least_squares_object(
    frames: &Array3<Complex64>,
    probe: &Array2<Complex64>,
    map: &PatchIndexMap,
    fallback: &Array2<Complex64>,
) -> (Array2<Complex64>, usize) {
    let mut weighted = frames.clone();
    for mut frame in weighted.axis_iter_mut(Axis(0)) {
        frame.zip_mut_with(probe, |f, p| *f *= p.conj());
    }
    let sum = scatter_add(&weighted, map);
    let intensity = probe.mapv(|p| p.norm_sqr());
    let weight = coverage_weight(&intensity, map);
    weighted_average(&sum, &weight, fallback)
}
