//! Projected Multi-Agent Consensus Equilibrium (PMACE) and its regularised
//! variant (reg-PMACE).
//!
//! Each measurement owns an agent `v_j`, a private copy of its patch. An
//! iteration applies the per-patch data-fitting proximal map
//!
//! $$
//! F_j(v) = \frac{v + a \bar P\, \Pi_{y_j}(P v)}{1 + a |P|^2}, \qquad a = \frac{\alpha}{\max |P|^2}
//! $$
//!
//! reflects, averages the reflected patches with weights $|P|^{\kappa}$ into
//! a consensus object $z$ and takes a Mann step towards the fixed point:
//!
//! $$
//! w = F(v), \quad z = G(2w - v), \quad v \leftarrow v + 2\rho\,(z_j - w)
//! $$
//!
//! reg-PMACE blends the consensus with a denoised copy before the Mann step.
//! In joint mode the probe gets its own agents, one per measurement, updated
//! the same way with the roles of object patch and probe exchanged.

use std::sync::Arc;

use ndarray::{Array2, Array3, Axis, Zip};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use speckle_compute::{default_backend, ComputeBackend};

use super::{check_non_negative, check_positive, check_unit_interval, PtychoSolver, ReconError};
use crate::monitor::{ConvergenceMonitor, IterationRecorder};
use crate::numeric::{inverse_floored, inverse_peak_power, weighted_average, InstabilityLog};
use crate::patch::{accumulate, extract_patches, PatchIndexMap};
use crate::prior::{Denoiser, PriorModel};
use crate::projection::project_magnitude;
use crate::propagation::Propagator;
use crate::types::{MeasurementSet, PtychoProblem, Reconstruction};

/// Regularisation settings for reg-PMACE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegParams {
    /// Weight of the denoised image in the consensus, in [0, 1].
    pub reg_wgt: f64,
    /// Noise level handed to the denoiser.
    pub noise_std: f64,
    pub prior: PriorModel,
}

impl Default for RegParams {
    fn default() -> Self {
        Self {
            reg_wgt: 0.6,
            noise_std: 0.02,
            prior: PriorModel::default(),
        }
    }
}

/// PMACE configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmaceParams {
    pub num_iter: usize,
    /// Data-fitting strength, scaled by `1 / max|P|²`.
    pub alpha: f64,
    /// Mann averaging parameter in (0, 1].
    pub rho: f64,
    /// Exponent of `|P|` in the object consensus weights, non-negative.
    pub probe_exp: f64,
    /// Exponent of `|O_j|` in the probe consensus weights (joint mode).
    pub obj_exp: f64,
    pub joint: bool,
    /// Probe data-fitting strength, scaled by `1 / max|O_j|²` (joint mode).
    pub probe_alpha: f64,
    /// `Some` selects reg-PMACE.
    pub reg: Option<RegParams>,
}

impl Default for PmaceParams {
    fn default() -> Self {
        Self {
            num_iter: 100,
            alpha: 0.8,
            rho: 0.5,
            probe_exp: 1.5,
            obj_exp: 0.0,
            joint: false,
            probe_alpha: 1.0,
            reg: None,
        }
    }
}

impl PmaceParams {
    fn validate(&self) -> Result<(), ReconError> {
        check_positive("alpha", self.alpha)?;
        check_unit_interval("rho", self.rho, false)?;
        check_non_negative("probe_exp", self.probe_exp)?;
        if self.joint {
            check_positive("probe_alpha", self.probe_alpha)?;
            check_non_negative("obj_exp", self.obj_exp)?;
        }
        if let Some(reg) = &self.reg {
            check_unit_interval("reg_wgt", reg.reg_wgt, true)?;
            check_non_negative("noise_std", reg.noise_std)?;
        }
        Ok(())
    }
}

/// PMACE / reg-PMACE solver.
#[derive(Clone)]
pub struct PmaceSolver {
    pub params: PmaceParams,
    backend: Arc<dyn ComputeBackend>,
    denoiser: Option<Arc<dyn Denoiser>>,
}

impl PmaceSolver {
    pub fn new(params: PmaceParams) -> Self {
        Self {
            params,
            backend: default_backend(),
            denoiser: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Use `denoiser` instead of the configured prior. Enables
    /// regularisation with default settings if it was off.
    pub fn with_denoiser(mut self, denoiser: Arc<dyn Denoiser>) -> Self {
        if self.params.reg.is_none() {
            self.params.reg = Some(RegParams::default());
        }
        self.denoiser = Some(denoiser);
        self
    }

    fn regulariser(&self) -> Option<(&RegParams, Arc<dyn Denoiser>)> {
        let reg = self.params.reg.as_ref()?;
        let denoiser = match &self.denoiser {
            Some(d) => Arc::clone(d),
            None => reg.prior.denoiser(),
        };
        Some((reg, denoiser))
    }
}

impl std::fmt::Debug for PmaceSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmaceSolver")
            .field("params", &self.params)
            .field("backend", &self.backend.device_info().name)
            .field("denoiser", &self.denoiser.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}

/// Apply the data-fitting proximal map to every agent.
///
/// `known(j)` is the factor held fixed for measurement `j` (the probe when
/// fitting object agents, the object patch when fitting probe agents).
fn fit_agents<'k, K>(
    backend: &dyn ComputeBackend,
    propagator: &Propagator,
    measurements: &MeasurementSet,
    agents: &Array3<Complex64>,
    strength: f64,
    known: K,
) -> Result<Array3<Complex64>, ReconError>
where
    K: Fn(usize) -> ndarray::ArrayView2<'k, Complex64> + Send + Sync,
{
    let mut fitted = agents.clone();
    backend.for_each_frame(&mut fitted, &|j, mut agent| {
        let factor = known(j);
        let frame = &agent * &factor;
        let projected = project_magnitude(propagator, &frame, &measurements.amplitude(j));
        Zip::from(&mut agent)
            .and(&factor)
            .and(&projected)
            .for_each(|v, k, y| {
                *v = (*v + strength * k.conj() * y) / (1.0 + strength * k.norm_sqr());
            });
    })?;
    Ok(fitted)
}

/// Mann step `v ← v + 2ρ(z_j - w_j)`.
fn mann_step<'z, Z>(agents: &mut Array3<Complex64>, fitted: &Array3<Complex64>, rho: f64, consensus: Z)
where
    Z: Fn(usize) -> ndarray::ArrayView2<'z, Complex64>,
{
    for (j, (mut v, w)) in agents
        .axis_iter_mut(Axis(0))
        .zip(fitted.axis_iter(Axis(0)))
        .enumerate()
    {
        Zip::from(&mut v)
            .and(&w)
            .and(consensus(j))
            .for_each(|v, &w, &z| *v += 2.0 * rho * (z - w));
    }
}

fn broadcast_agents(probe: &Array2<Complex64>, count: usize) -> Array3<Complex64> {
    let (m, n) = probe.dim();
    let mut agents = Array3::<Complex64>::zeros((count, m, n));
    for mut agent in agents.axis_iter_mut(Axis(0)) {
        agent.assign(probe);
    }
    agents
}

impl PtychoSolver for PmaceSolver {
    fn reconstruct(
        &self,
        problem: &PtychoProblem,
        recorder: &mut dyn IterationRecorder,
    ) -> Result<Reconstruction, ReconError> {
        let params = &self.params;
        params.validate()?;

        let method = self.method_name();
        let map: &PatchIndexMap = &problem.index_map;
        let measurements = &problem.measurements;
        let backend = self.backend.as_ref();
        let regulariser = self.regulariser();
        let propagator = Propagator::new(map.probe_shape());
        let mut monitor = ConvergenceMonitor::new(method, problem, &propagator, params.joint);
        let mut instability = InstabilityLog::new();

        let mut object = problem.init_object.clone();
        let mut probe = problem.probe.clone();
        let mut agents = extract_patches(&object, map);
        let mut probe_agents = params.joint.then(|| broadcast_agents(&probe, map.len()));

        log::info!(
            "{} starts: {} measurements, {} iterations, alpha={}, rho={}, joint={}",
            method,
            map.len(),
            params.num_iter,
            params.alpha,
            params.rho,
            params.joint
        );
        if let Some((reg, denoiser)) = &regulariser {
            log::debug!(
                "{} prior: {} (reg_wgt={}, noise_std={})",
                method,
                denoiser.name(),
                reg.reg_wgt,
                reg.noise_std
            );
        }

        for i in 0..params.num_iter {
            monitor.begin_iteration();

            // w = F(v)
            let (inv_probe_power, floored) = inverse_peak_power(&probe);
            instability.report(i, "object data-fit strength", usize::from(floored));
            let fitted = fit_agents(
                backend,
                &propagator,
                measurements,
                &agents,
                params.alpha * inv_probe_power,
                |_| probe.view(),
            )?;

            // z = G(2w - v), optionally blended with the denoised consensus
            let reflected = Zip::from(&fitted)
                .and(&agents)
                .map_collect(|&w, &v| 2.0 * w - v);
            let weight = probe.mapv(|p| p.norm().powf(params.probe_exp));
            let (sum, total) = accumulate(&reflected, map, Some(&weight));
            let (mut consensus, floored) = weighted_average(&sum, &total, &object);
            instability.report(i, "object consensus", floored);
            if let Some((reg, denoiser)) = &regulariser {
                let denoised = denoiser.apply(&consensus, reg.noise_std);
                let wgt = reg.reg_wgt;
                Zip::from(&mut consensus)
                    .and(&denoised)
                    .for_each(|z, &d| *z = (1.0 - wgt) * *z + wgt * d);
            }

            mann_step(&mut agents, &fitted, params.rho, |j| map.window(j).view(&consensus));
            object = consensus;

            if let Some(probe_agents) = probe_agents.as_mut() {
                let patches = extract_patches(&object, map);
                let peak = patches.iter().fold(0.0_f64, |m, o| m.max(o.norm_sqr()));
                let (inv_patch_power, floored) = inverse_floored(peak);
                instability.report(i, "probe data-fit strength", usize::from(floored));
                let fitted_probe = fit_agents(
                    backend,
                    &propagator,
                    measurements,
                    probe_agents,
                    params.probe_alpha * inv_patch_power,
                    |j| patches.index_axis(Axis(0), j),
                )?;

                let mut sum = Array2::<Complex64>::zeros(probe.dim());
                let mut total = Array2::<f64>::zeros(probe.dim());
                for ((w, v), o) in fitted_probe
                    .axis_iter(Axis(0))
                    .zip(probe_agents.axis_iter(Axis(0)))
                    .zip(patches.axis_iter(Axis(0)))
                {
                    Zip::from(&mut sum)
                        .and(&mut total)
                        .and(&w)
                        .and(&v)
                        .and(&o)
                        .for_each(|s, t, &w, &v, o| {
                            let wt = o.norm().powf(params.obj_exp);
                            *s += wt * (2.0 * w - v);
                            *t += wt;
                        });
                }
                let (next_probe, floored) = weighted_average(&sum, &total, &probe);
                instability.report(i, "probe consensus", floored);

                mann_step(probe_agents, &fitted_probe, params.rho, |_| next_probe.view());
                probe = next_probe;
            }

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
        if self.params.reg.is_some() {
            "reg-PMACE"
        } else {
            "PMACE"
        }
    }
}
