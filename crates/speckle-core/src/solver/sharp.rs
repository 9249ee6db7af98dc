//! Relaxed averaged projections (SHARP) and relaxed averaged alternating
//! reflections (SHARP+).
//!
//! SHARP moves every frame a fraction `relax_pm` of the way to its data
//! projection and refits the object by probe-weighted least squares:
//!
//! $$
//! O \leftarrow \frac{\sum_j P_j^\top \bar P \left(\beta\,\Pi_{y_j}(P O_j) + (1-\beta) P O_j\right)}
//!                   {\sum_j P_j^\top |P|^2}
//! $$
//!
//! SHARP+ keeps a stack of frames $\psi$ and runs the RAAR recursion between
//! the data constraint and the overlap constraint:
//!
//! $$
//! \psi \leftarrow \beta\psi + \beta\,\Pi_O(2\Pi_F\psi - \psi) + (1-2\beta)\,\Pi_F\psi
//! $$
//!
//! with the reported object fitted to $\Pi_F\psi$.

use std::sync::Arc;

use ndarray::Zip;
use serde::{Deserialize, Serialize};
use speckle_compute::{default_backend, ComputeBackend};

use super::{check_open_unit_interval, illuminated_frames, least_squares_object};
use super::{PtychoSolver, ReconError};
use crate::monitor::{ConvergenceMonitor, IterationRecorder};
use crate::numeric::InstabilityLog;
use crate::projection::project_magnitude;
use crate::propagation::Propagator;
use crate::types::{PtychoProblem, Reconstruction};

/// SHARP / SHARP+ configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpParams {
    pub num_iter: usize,
    /// Relaxation weight in (0, 1).
    pub relax_pm: f64,
    /// Use the RAAR recursion (SHARP+).
    pub plus: bool,
}

impl Default for SharpParams {
    fn default() -> Self {
        Self {
            num_iter: 100,
            relax_pm: 0.75,
            plus: false,
        }
    }
}

/// SHARP / SHARP+ solver. Object only; the probe is held fixed.
#[derive(Clone)]
pub struct SharpSolver {
    pub params: SharpParams,
    backend: Arc<dyn ComputeBackend>,
}

impl SharpSolver {
    pub fn new(params: SharpParams) -> Self {
        Self {
            params,
            backend: default_backend(),
        }
    }

    /// Shorthand for SHARP+.
    pub fn plus(params: SharpParams) -> Self {
        Self::new(SharpParams {
            plus: true,
            ..params
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }
}

impl std::fmt::Debug for SharpSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharpSolver")
            .field("params", &self.params)
            .field("backend", &self.backend.device_info().name)
            .finish()
    }
}

impl PtychoSolver for SharpSolver {
    fn reconstruct(
        &self,
        problem: &PtychoProblem,
        recorder: &mut dyn IterationRecorder,
    ) -> Result<Reconstruction, ReconError> {
        let params = &self.params;
        check_open_unit_interval("relax_pm", params.relax_pm)?;

        let method = self.method_name();
        let map = &problem.index_map;
        let probe = &problem.probe;
        let backend = self.backend.as_ref();
        let propagator = Propagator::new(map.probe_shape());
        let mut monitor = ConvergenceMonitor::new(method, problem, &propagator, false);
        let mut instability = InstabilityLog::new();
        let beta = params.relax_pm;

        let mut object = problem.init_object.clone();
        let mut frames = if params.plus {
            Some(illuminated_frames(backend, &object, probe, map)?)
        } else {
            None
        };

        log::info!(
            "{} starts: {} measurements, {} iterations, relax_pm={}",
            method,
            map.len(),
            params.num_iter,
            beta
        );

        for i in 0..params.num_iter {
            monitor.begin_iteration();

            match frames.as_mut() {
                None => {
                    let relaxed = backend.fill_frames(map.len(), map.probe_shape(), &|j, mut out| {
                        let frame = &map.window(j).view(&object) * probe;
                        let projected = project_magnitude(
                            &propagator,
                            &frame,
                            &problem.measurements.amplitude(j),
                        );
                        Zip::from(&mut out)
                            .and(&frame)
                            .and(&projected)
                            .for_each(|o, &f, &p| *o = beta * p + (1.0 - beta) * f);
                    })?;
                    let (next, floored) = least_squares_object(&relaxed, probe, map, &object);
                    instability.report(i, "least-squares object fit", floored);
                    object = next;
                }
                Some(psi) => {
                    // Π_F ψ
                    let mut fitted = psi.clone();
                    backend.for_each_frame(&mut fitted, &|j, mut frame| {
                        let projected = project_magnitude(
                            &propagator,
                            &frame,
                            &problem.measurements.amplitude(j),
                        );
                        frame.assign(&projected);
                    })?;

                    // Π_O (2 Π_F ψ - ψ)
                    let reflected = Zip::from(&fitted)
                        .and(&*psi)
                        .map_collect(|&w, &p| 2.0 * w - p);
                    let (reflected_object, floored) =
                        least_squares_object(&reflected, probe, map, &object);
                    instability.report(i, "least-squares object fit", floored);
                    let consistent = illuminated_frames(backend, &reflected_object, probe, map)?;

                    Zip::from(&mut *psi)
                        .and(&consistent)
                        .and(&fitted)
                        .for_each(|p, &q, &w| *p = beta * *p + beta * q + (1.0 - 2.0 * beta) * w);

                    let (next, floored) = least_squares_object(&fitted, probe, map, &object);
                    instability.report(i, "least-squares object fit", floored);
                    object = next;
                }
            }

            monitor.end_iteration(i, &object, probe, recorder);
        }

        let history = monitor.finish();
        Ok(Reconstruction {
            method: method.to_string(),
            object,
            probe: None,
            history,
            warnings: instability.into_warnings(),
        })
    }

    fn method_name(&self) -> &str {
        if self.params.plus {
            "SHARP+"
        } else {
            "SHARP"
        }
    }
}
