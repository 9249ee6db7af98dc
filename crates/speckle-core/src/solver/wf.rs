//! Wirtinger flow (WF) and accelerated Wirtinger flow (AWF).
//!
//! Batch gradient descent on the amplitude loss. All residuals of an
//! iteration are computed from the same point, then combined:
//!
//! $$
//! \nabla_x = \sum_j P_j^\top \bar P \left(P x_j - \Pi_{y_j}(P x_j)\right),
//! \qquad x \leftarrow x - \mu \nabla_x
//! $$
//!
//! The default step is the inverse of the largest accumulated probe power
//! $\max \sum_j P_j^\top |P|^2$. AWF evaluates the gradient at the Nesterov
//! point $x_k + \tfrac{k}{k+3}(x_k - x_{k-1})$, which equals $x_0$ in the
//! first iteration.

use std::sync::Arc;

use ndarray::{Array2, Axis, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use speckle_compute::{default_backend, ComputeBackend};

use super::{check_positive, PtychoSolver, ReconError};
use crate::monitor::{ConvergenceMonitor, IterationRecorder};
use crate::numeric::{inverse_floored, InstabilityLog};
use crate::patch::{coverage_weight, scatter_add};
use crate::projection::project_magnitude;
use crate::propagation::Propagator;
use crate::types::{PtychoProblem, Reconstruction};

/// WF / AWF configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WfParams {
    pub num_iter: usize,
    /// Nesterov acceleration (AWF).
    pub accel: bool,
    /// Fixed object step. `None` uses the inverse peak accumulated probe power.
    pub step_sz: Option<f64>,
    pub joint: bool,
}

impl Default for WfParams {
    fn default() -> Self {
        Self {
            num_iter: 100,
            accel: false,
            step_sz: None,
            joint: false,
        }
    }
}

/// Momentum weight for iteration `k`.
fn momentum(k: usize) -> f64 {
    k as f64 / (k as f64 + 3.0)
}

/// WF / AWF solver.
#[derive(Clone)]
pub struct WfSolver {
    pub params: WfParams,
    backend: Arc<dyn ComputeBackend>,
}

impl WfSolver {
    pub fn new(params: WfParams) -> Self {
        Self {
            params,
            backend: default_backend(),
        }
    }

    /// Shorthand for the accelerated variant.
    pub fn accelerated(params: WfParams) -> Self {
        Self::new(WfParams {
            accel: true,
            ..params
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }
}

impl std::fmt::Debug for WfSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WfSolver")
            .field("params", &self.params)
            .field("backend", &self.backend.device_info().name)
            .finish()
    }
}

impl PtychoSolver for WfSolver {
    fn reconstruct(
        &self,
        problem: &PtychoProblem,
        recorder: &mut dyn IterationRecorder,
    ) -> Result<Reconstruction, ReconError> {
        let params = &self.params;
        if let Some(step) = params.step_sz {
            check_positive("step_sz", step)?;
        }
        let method = self.method_name();
        let map = &problem.index_map;
        let propagator = Propagator::new(map.probe_shape());
        let mut monitor = ConvergenceMonitor::new(method, problem, &propagator, params.joint);
        let mut instability = InstabilityLog::new();

        let mut object = problem.init_object.clone();
        let mut previous = object.clone();
        let mut probe = problem.probe.clone();

        log::info!(
            "{} starts: {} measurements, {} iterations, backend={}",
            method,
            map.len(),
            params.num_iter,
            self.backend.device_info().name
        );

        for i in 0..params.num_iter {
            monitor.begin_iteration();

            let beta = if params.accel { momentum(i) } else { 0.0 };
            let point = if beta > 0.0 {
                Zip::from(&object)
                    .and(&previous)
                    .map_collect(|&x, &x_prev| x + beta * (x - x_prev))
            } else {
                object.clone()
            };

            // Residual P x_j - Π(P x_j) for every measurement.
            let residuals = self
                .backend
                .fill_frames(map.len(), map.probe_shape(), &|j, mut out| {
                    let frame = &map.window(j).view(&point) * &probe;
                    let projected =
                        project_magnitude(&propagator, &frame, &problem.measurements.amplitude(j));
                    out.assign(&(frame - projected));
                })?;

            let mut back_projected = residuals.clone();
            for mut frame in back_projected.axis_iter_mut(Axis(0)) {
                frame.zip_mut_with(&probe, |r, p| *r *= p.conj());
            }
            let gradient = scatter_add(&back_projected, map);

            let step = match params.step_sz {
                Some(step) => step,
                None => {
                    let power = coverage_weight(&probe.mapv(|p| p.norm_sqr()), map);
                    let peak = power.iter().fold(0.0_f64, |m, &v| m.max(v));
                    let (inv, floored) = inverse_floored(peak);
                    instability.report(i, "object step size", usize::from(floored));
                    inv
                }
            };

            if params.joint {
                let mut probe_gradient = Array2::<Complex64>::zeros(probe.dim());
                let mut patch_power = Array2::<f64>::zeros(probe.dim());
                for (window, residual) in map.windows().iter().zip(residuals.axis_iter(Axis(0))) {
                    Zip::from(&mut probe_gradient)
                        .and(&mut patch_power)
                        .and(window.view(&point))
                        .and(&residual)
                        .for_each(|g, pw, o, r| {
                            *g += o.conj() * r;
                            *pw += o.norm_sqr();
                        });
                }
                let peak = patch_power.iter().fold(0.0_f64, |m, &v| m.max(v));
                let (probe_step, floored) = inverse_floored(peak);
                instability.report(i, "probe step size", usize::from(floored));
                Zip::from(&mut probe)
                    .and(&probe_gradient)
                    .for_each(|p, &g| *p -= probe_step * g);
            }

            previous = object;
            object = Zip::from(&point)
                .and(&gradient)
                .map_collect(|&x, &g| x - step * g);

            monitor.end_iteration(i, &object, &probe, recorder);
        }

        let history = monitor.finish();
        Ok(Reconstruction {
            method: method.to_string(),
            object,
            probe: params.joint.then_some(probe),
            history,
            warnings: instability.into_warnings(),
        })
    }

    fn method_name(&self) -> &str {
        if self.params.accel {
            "AWF"
        } else {
            "WF"
        }
    }
}
