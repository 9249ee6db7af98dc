//! Core types shared across the Speckle framework.
//!
//! This module defines the measurement container, the validated problem
//! definition handed to every solver, and the reconstruction output.

use ndarray::{Array2, Array3, ArrayView2, Axis};
use num_complex::Complex64;

use crate::monitor::ConvergenceHistory;
use crate::numeric::NumericalInstabilityWarning;
use crate::patch::PatchIndexMap;
use crate::solver::ReconError;

/// An ordered stack of diffraction frames, stored as amplitudes.
///
/// Frame `j` belongs to window `j` of the accompanying [`PatchIndexMap`].
#[derive(Debug, Clone)]
pub struct MeasurementSet {
    amplitudes: Array3<f64>,
}

impl MeasurementSet {
    /// Build a measurement set from recorded intensities, shape `(N, m, n)`.
    ///
    /// Negative intensities (left over from background subtraction) are
    /// clamped to zero before the square root. Non-finite values are rejected.
    pub fn from_intensities(intensities: Array3<f64>) -> Result<Self, ReconError> {
        check_finite(&intensities)?;
        let mut clamped = 0usize;
        let amplitudes = intensities.mapv(|v| {
            if v < 0.0 {
                clamped += 1;
                0.0
            } else {
                v.sqrt()
            }
        });
        if clamped > 0 {
            log::debug!("Clamped {} negative intensities to zero", clamped);
        }
        Self::checked(amplitudes)
    }

    /// Build a measurement set from amplitudes (square roots of intensity).
    pub fn from_amplitudes(amplitudes: Array3<f64>) -> Result<Self, ReconError> {
        check_finite(&amplitudes)?;
        if let Some(v) = amplitudes.iter().find(|v| **v < 0.0) {
            return Err(ReconError::InvalidMeasurement(format!(
                "amplitudes must be non-negative, found {v}"
            )));
        }
        Self::checked(amplitudes)
    }

    fn checked(amplitudes: Array3<f64>) -> Result<Self, ReconError> {
        let (count, rows, cols) = amplitudes.dim();
        if count == 0 || rows == 0 || cols == 0 {
            return Err(ReconError::ShapeMismatch(format!(
                "measurement stack must be non-empty, got shape {:?}",
                amplitudes.shape()
            )));
        }
        Ok(Self { amplitudes })
    }

    /// Number of diffraction frames.
    pub fn len(&self) -> usize {
        self.amplitudes.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape `(m, n)` of a single frame.
    pub fn frame_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.amplitudes.dim();
        (rows, cols)
    }

    /// Amplitude of frame `j`.
    pub fn amplitude(&self, j: usize) -> ArrayView2<'_, f64> {
        self.amplitudes.index_axis(Axis(0), j)
    }

    pub fn amplitudes(&self) -> &Array3<f64> {
        &self.amplitudes
    }
}

fn check_finite(values: &Array3<f64>) -> Result<(), ReconError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(idx) => Err(ReconError::InvalidMeasurement(format!(
            "non-finite value at flat index {idx}"
        ))),
        None => Ok(()),
    }
}

/// Ground truth used only for error computation.
#[derive(Debug, Clone, Default)]
pub struct ReferenceImages {
    /// Reference object, same shape as the object estimate.
    pub object: Option<Array2<Complex64>>,
    /// Reference probe, same shape as the probe.
    pub probe: Option<Array2<Complex64>>,
    /// Real mask restricting where object error is measured (1 inside).
    pub window: Option<Array2<f64>>,
}

/// A fully validated reconstruction problem.
#[derive(Debug, Clone)]
pub struct PtychoProblem {
    pub measurements: MeasurementSet,
    pub index_map: PatchIndexMap,
    /// Known (or initial, in joint mode) probe, shape `(m, n)`.
    pub probe: Array2<Complex64>,
    /// Initial object estimate, shape of the index map's object.
    pub init_object: Array2<Complex64>,
    pub reference: ReferenceImages,
}

impl PtychoProblem {
    /// Assemble a problem, checking that all shapes agree.
    pub fn new(
        measurements: MeasurementSet,
        index_map: PatchIndexMap,
        probe: Array2<Complex64>,
        init_object: Array2<Complex64>,
    ) -> Result<Self, ReconError> {
        if measurements.len() != index_map.len() {
            return Err(ReconError::ShapeMismatch(format!(
                "{} measurements but {} scan windows",
                measurements.len(),
                index_map.len()
            )));
        }
        if measurements.frame_shape() != probe.dim() {
            return Err(ReconError::ShapeMismatch(format!(
                "frame shape {:?} differs from probe shape {:?}",
                measurements.frame_shape(),
                probe.dim()
            )));
        }
        if index_map.probe_shape() != probe.dim() {
            return Err(ReconError::ShapeMismatch(format!(
                "scan windows are {:?} but probe is {:?}",
                index_map.probe_shape(),
                probe.dim()
            )));
        }
        if index_map.object_shape() != init_object.dim() {
            return Err(ReconError::ShapeMismatch(format!(
                "initial object is {:?} but scan geometry needs {:?}",
                init_object.dim(),
                index_map.object_shape()
            )));
        }
        Ok(Self {
            measurements,
            index_map,
            probe,
            init_object,
            reference: ReferenceImages::default(),
        })
    }

    /// Attach reference images for error tracking.
    pub fn with_reference(mut self, reference: ReferenceImages) -> Result<Self, ReconError> {
        let object_shape = self.index_map.object_shape();
        if let Some(obj) = &reference.object {
            if obj.dim() != object_shape {
                return Err(ReconError::ShapeMismatch(format!(
                    "reference object is {:?}, expected {:?}",
                    obj.dim(),
                    object_shape
                )));
            }
        }
        if let Some(probe) = &reference.probe {
            if probe.dim() != self.probe.dim() {
                return Err(ReconError::ShapeMismatch(format!(
                    "reference probe is {:?}, expected {:?}",
                    probe.dim(),
                    self.probe.dim()
                )));
            }
        }
        if let Some(window) = &reference.window {
            if window.dim() != object_shape {
                return Err(ReconError::ShapeMismatch(format!(
                    "error window is {:?}, expected {:?}",
                    window.dim(),
                    object_shape
                )));
            }
        }
        self.reference = reference;
        Ok(self)
    }
}

/// Output of a reconstruction run.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Name of the method that produced this result.
    pub method: String,
    /// Final object estimate.
    pub object: Array2<Complex64>,
    /// Final probe estimate; `Some` only for joint reconstructions.
    pub probe: Option<Array2<Complex64>>,
    /// Per-iteration errors and timing.
    pub history: ConvergenceHistory,
    /// Divisions that hit the magnitude floor during the run.
    pub warnings: Vec<NumericalInstabilityWarning>,
}
