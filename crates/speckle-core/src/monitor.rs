//! Convergence monitoring.
//!
//! The monitor runs beside the iteration and never feeds back into it. Per
//! iteration it records:
//!
//! - **object error**: NRMSE against the reference object after the global
//!   phase/scale normalisation (the image is only recoverable up to a complex
//!   constant);
//! - **probe error**: the same for the probe, joint runs only;
//! - **diffraction error**: $\lVert |\mathcal{F}(P O_j)| - y_j \rVert / \lVert y \rVert$
//!   over all frames;
//! - **elapsed time**: cumulative solver time, excluding metric evaluation.
//!
//! Histories are indexed by iteration number starting at 0. Side effects such
//! as image snapshots go through an [`IterationRecorder`] invoked at iteration
//! boundaries, so the solvers themselves perform no I/O.

use std::time::{Duration, Instant};

use ndarray::{Array2, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::projection::magnitude_misfit;
use crate::propagation::Propagator;
use crate::types::PtychoProblem;

/// Per-iteration error and timing sequences of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceHistory {
    /// Object NRMSE; empty when no reference object was supplied.
    pub object_error: Vec<f64>,
    /// Probe NRMSE; empty unless the run was joint and a reference probe was supplied.
    pub probe_error: Vec<f64>,
    /// Diffraction-domain NRMSE.
    pub diffraction_error: Vec<f64>,
    /// Cumulative solver time in seconds at the end of each iteration.
    pub elapsed_secs: Vec<f64>,
}

impl ConvergenceHistory {
    /// Number of completed iterations.
    pub fn len(&self) -> usize {
        self.diffraction_error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffraction_error.is_empty()
    }
}

/// State handed to an [`IterationRecorder`] after each iteration.
#[derive(Debug)]
pub struct IterationSnapshot<'a> {
    pub method: &'a str,
    pub iteration: usize,
    pub object: &'a Array2<Complex64>,
    pub probe: &'a Array2<Complex64>,
    pub object_error: Option<f64>,
    pub probe_error: Option<f64>,
    pub diffraction_error: f64,
    pub elapsed_secs: f64,
}

/// Receives the estimate at every iteration boundary.
pub trait IterationRecorder {
    fn record(&mut self, snapshot: &IterationSnapshot<'_>);
}

/// Recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl IterationRecorder for NullRecorder {
    fn record(&mut self, _snapshot: &IterationSnapshot<'_>) {}
}

/// A buffered copy of the object (and probe) at one iteration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub iteration: usize,
    pub object: Array2<Complex64>,
    pub probe: Array2<Complex64>,
}

/// Keeps every `every`-th iteration (and the last one seen) in memory, for
/// the caller to persist after the run.
#[derive(Debug, Clone)]
pub struct SnapshotRecorder {
    every: usize,
    snapshots: Vec<Snapshot>,
    last: Option<Snapshot>,
}

impl SnapshotRecorder {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            snapshots: Vec::new(),
            last: None,
        }
    }

    /// Buffered snapshots, ending with the final iteration.
    pub fn into_snapshots(self) -> Vec<Snapshot> {
        let mut snapshots = self.snapshots;
        if let Some(last) = self.last {
            if snapshots.last().map(|s| s.iteration) != Some(last.iteration) {
                snapshots.push(last);
            }
        }
        snapshots
    }
}

impl IterationRecorder for SnapshotRecorder {
    fn record(&mut self, snapshot: &IterationSnapshot<'_>) {
        let copy = Snapshot {
            iteration: snapshot.iteration,
            object: snapshot.object.clone(),
            probe: snapshot.probe.clone(),
        };
        if (snapshot.iteration + 1) % self.every == 0 {
            self.snapshots.push(copy);
            self.last = None;
        } else {
            self.last = Some(copy);
        }
    }
}

/// Multiply `image` by the complex constant that best matches `reference`
/// in the least-squares sense, inside `window` (all pixels when `None`).
///
/// An all-zero image is returned unchanged.
pub fn phase_normalize(
    image: &Array2<Complex64>,
    reference: &Array2<Complex64>,
    window: Option<&Array2<f64>>,
) -> Array2<Complex64> {
    let (cross, energy) = match window {
        Some(w) => Zip::from(image).and(reference).and(w).fold(
            (Complex64::new(0.0, 0.0), 0.0),
            |(c, e), x, r, &wt| (c + wt * x.conj() * r, e + wt * x.norm_sqr()),
        ),
        None => Zip::from(image).and(reference).fold(
            (Complex64::new(0.0, 0.0), 0.0),
            |(c, e), x, r| (c + x.conj() * r, e + x.norm_sqr()),
        ),
    };
    if energy > 0.0 && energy.is_finite() {
        let scale = cross / energy;
        image.mapv(|x| x * scale)
    } else {
        image.clone()
    }
}

/// Normalised root-mean-square error `‖x - r‖ / ‖r‖` inside `window`.
///
/// Falls back to the unnormalised RMS difference when the reference is zero.
pub fn nrmse(
    image: &Array2<Complex64>,
    reference: &Array2<Complex64>,
    window: Option<&Array2<f64>>,
) -> f64 {
    let (diff, energy) = match window {
        Some(w) => Zip::from(image).and(reference).and(w).fold(
            (0.0, 0.0),
            |(d, e), x, r, &wt| (d + wt * (x - r).norm_sqr(), e + wt * r.norm_sqr()),
        ),
        None => Zip::from(image)
            .and(reference)
            .fold((0.0, 0.0), |(d, e), x, r| (d + (x - r).norm_sqr(), e + r.norm_sqr())),
    };
    if energy > 0.0 {
        (diff / energy).sqrt()
    } else {
        diff.sqrt()
    }
}

/// NRMSE after global phase/scale normalisation.
pub fn normalized_error(
    image: &Array2<Complex64>,
    reference: &Array2<Complex64>,
    window: Option<&Array2<f64>>,
) -> f64 {
    nrmse(&phase_normalize(image, reference, window), reference, window)
}

/// Diffraction-domain NRMSE of the current estimate over all measurements.
pub fn diffraction_error(
    propagator: &Propagator,
    problem: &PtychoProblem,
    object: &Array2<Complex64>,
    probe: &Array2<Complex64>,
) -> f64 {
    let map = &problem.index_map;
    let misfit: f64 = map
        .windows()
        .iter()
        .enumerate()
        .map(|(j, window)| {
            let frame = &window.view(object) * probe;
            magnitude_misfit(propagator, &frame, &problem.measurements.amplitude(j))
        })
        .sum();
    let energy: f64 = problem
        .measurements
        .amplitudes()
        .iter()
        .map(|y| y * y)
        .sum();
    if energy > 0.0 {
        (misfit / energy).sqrt()
    } else {
        misfit.sqrt()
    }
}

/// Builds the [`ConvergenceHistory`] of one run.
pub struct ConvergenceMonitor<'a> {
    method: &'a str,
    problem: &'a PtychoProblem,
    propagator: &'a Propagator,
    track_probe: bool,
    history: ConvergenceHistory,
    solver_time: Duration,
    iteration_start: Option<Instant>,
}

impl<'a> ConvergenceMonitor<'a> {
    pub fn new(
        method: &'a str,
        problem: &'a PtychoProblem,
        propagator: &'a Propagator,
        track_probe: bool,
    ) -> Self {
        Self {
            method,
            problem,
            propagator,
            track_probe,
            history: ConvergenceHistory::default(),
            solver_time: Duration::ZERO,
            iteration_start: None,
        }
    }

    /// Start the solver clock for the next iteration.
    pub fn begin_iteration(&mut self) {
        self.iteration_start = Some(Instant::now());
    }

    /// Stop the clock, evaluate the metrics and notify `recorder`.
    pub fn end_iteration(
        &mut self,
        iteration: usize,
        object: &Array2<Complex64>,
        probe: &Array2<Complex64>,
        recorder: &mut dyn IterationRecorder,
    ) {
        if let Some(start) = self.iteration_start.take() {
            self.solver_time += start.elapsed();
        }
        let elapsed_secs = self.solver_time.as_secs_f64();
        let reference = &self.problem.reference;
        let window = reference.window.as_ref();

        let object_error = reference
            .object
            .as_ref()
            .map(|r| normalized_error(object, r, window));
        let probe_error = if self.track_probe {
            reference
                .probe
                .as_ref()
                .map(|r| normalized_error(probe, r, None))
        } else {
            None
        };
        let diffraction_error = diffraction_error(self.propagator, self.problem, object, probe);

        if let Some(e) = object_error {
            self.history.object_error.push(e);
        }
        if let Some(e) = probe_error {
            self.history.probe_error.push(e);
        }
        self.history.diffraction_error.push(diffraction_error);
        self.history.elapsed_secs.push(elapsed_secs);

        log::debug!(
            "{} iter {}: obj_err={:?} probe_err={:?} diffr_err={:.4e}",
            self.method,
            iteration,
            object_error,
            probe_error,
            diffraction_error
        );

        recorder.record(&IterationSnapshot {
            method: self.method,
            iteration,
            object,
            probe,
            object_error,
            probe_error,
            diffraction_error,
            elapsed_secs,
        });
    }

    pub fn finish(self) -> ConvergenceHistory {
        log::info!(
            "{} finished {} iterations in {:.3} s",
            self.method,
            self.history.len(),
            self.solver_time.as_secs_f64()
        );
        self.history
    }
}
