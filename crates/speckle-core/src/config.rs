//! TOML configuration deserialisation for reconstruction jobs.
//!
//! ```toml
//! [recon]
//! num_iter = 100
//! joint = false
//! seed = 0
//!
//! [epie]
//! obj_step_sz = 0.5
//!
//! [reg_pmace]
//! alpha = 0.8
//! reg_wgt = 0.6
//! prior = { kind = "gaussian_smoothing", sigma = 0.8 }
//! ```
//!
//! A method runs when its section is present. A file without any method
//! section runs all of them with default settings.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::prior::PriorModel;
use crate::solver::epie::{EpieParams, EpieSolver};
use crate::solver::pmace::{PmaceParams, PmaceSolver, RegParams};
use crate::solver::sharp::{SharpParams, SharpSolver};
use crate::solver::wf::{WfParams, WfSolver};
use crate::solver::PtychoSolver;

/// Errors raised while loading a job file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level job configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub recon: ReconConfig,
    pub epie: Option<EpieConfig>,
    pub wf: Option<WfConfig>,
    pub awf: Option<WfConfig>,
    pub sharp: Option<SharpConfig>,
    pub sharp_plus: Option<SharpConfig>,
    pub pmace: Option<PmaceConfig>,
    pub reg_pmace: Option<RegPmaceConfig>,
}

/// Settings shared by every method, so histories have equal length.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_num_iter")]
    pub num_iter: usize,
    /// Reconstruct the probe as well (ePIE, WF, AWF, PMACE, reg-PMACE).
    #[serde(default)]
    pub joint: bool,
    /// Seed for ePIE's visiting order. Omit for a fresh order each run.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            num_iter: default_num_iter(),
            joint: false,
            seed: None,
        }
    }
}

fn default_num_iter() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpieConfig {
    #[serde(default = "default_one")]
    pub obj_step_sz: f64,
    #[serde(default = "default_one")]
    pub probe_step_sz: f64,
}

impl Default for EpieConfig {
    fn default() -> Self {
        Self {
            obj_step_sz: 1.0,
            probe_step_sz: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WfConfig {
    /// Fixed object step; computed from the probe when omitted.
    #[serde(default)]
    pub step_sz: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharpConfig {
    #[serde(default = "default_relax_pm")]
    pub relax_pm: f64,
}

impl Default for SharpConfig {
    fn default() -> Self {
        Self {
            relax_pm: default_relax_pm(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PmaceConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default = "default_probe_exp")]
    pub probe_exp: f64,
    #[serde(default)]
    pub obj_exp: f64,
    #[serde(default = "default_one")]
    pub probe_alpha: f64,
}

impl Default for PmaceConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            rho: default_rho(),
            probe_exp: default_probe_exp(),
            obj_exp: 0.0,
            probe_alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegPmaceConfig {
    #[serde(flatten)]
    pub pmace: PmaceConfig,
    #[serde(default = "default_reg_wgt")]
    pub reg_wgt: f64,
    #[serde(default = "default_noise_std")]
    pub noise_std: f64,
    #[serde(default)]
    pub prior: PriorModel,
}

impl Default for RegPmaceConfig {
    fn default() -> Self {
        Self {
            pmace: PmaceConfig::default(),
            reg_wgt: default_reg_wgt(),
            noise_std: default_noise_std(),
            prior: PriorModel::default(),
        }
    }
}

fn default_one() -> f64 {
    1.0
}
fn default_relax_pm() -> f64 {
    0.75
}
fn default_alpha() -> f64 {
    0.8
}
fn default_rho() -> f64 {
    0.5
}
fn default_probe_exp() -> f64 {
    1.5
}
fn default_reg_wgt() -> f64 {
    0.6
}
fn default_noise_std() -> f64 {
    0.02
}

impl JobConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn has_method_sections(&self) -> bool {
        self.epie.is_some()
            || self.wf.is_some()
            || self.awf.is_some()
            || self.sharp.is_some()
            || self.sharp_plus.is_some()
            || self.pmace.is_some()
            || self.reg_pmace.is_some()
    }

    /// Build the configured solvers in the order ePIE, WF, AWF, SHARP,
    /// SHARP+, PMACE, reg-PMACE.
    pub fn solvers(&self) -> Vec<Box<dyn PtychoSolver>> {
        let all = !self.has_method_sections();
        let ReconConfig {
            num_iter,
            joint,
            seed,
        } = self.recon;

        let mut solvers: Vec<Box<dyn PtychoSolver>> = Vec::new();
        if let Some(c) = self.epie.clone().or_else(|| all.then(EpieConfig::default)) {
            solvers.push(Box::new(EpieSolver::new(EpieParams {
                num_iter,
                obj_step_sz: c.obj_step_sz,
                probe_step_sz: c.probe_step_sz,
                joint,
                seed,
            })));
        }
        for (section, accel) in [(&self.wf, false), (&self.awf, true)] {
            if let Some(c) = section.clone().or_else(|| all.then(WfConfig::default)) {
                solvers.push(Box::new(WfSolver::new(WfParams {
                    num_iter,
                    accel,
                    step_sz: c.step_sz,
                    joint,
                })));
            }
        }
        for (section, plus) in [(&self.sharp, false), (&self.sharp_plus, true)] {
            if let Some(c) = section.clone().or_else(|| all.then(SharpConfig::default)) {
                solvers.push(Box::new(SharpSolver::new(SharpParams {
                    num_iter,
                    relax_pm: c.relax_pm,
                    plus,
                })));
            }
        }
        if let Some(c) = self.pmace.clone().or_else(|| all.then(PmaceConfig::default)) {
            solvers.push(Box::new(PmaceSolver::new(pmace_params(&c, num_iter, joint, None))));
        }
        if let Some(c) = self.reg_pmace.clone().or_else(|| all.then(RegPmaceConfig::default)) {
            let reg = RegParams {
                reg_wgt: c.reg_wgt,
                noise_std: c.noise_std,
                prior: c.prior.clone(),
            };
            solvers.push(Box::new(PmaceSolver::new(pmace_params(
                &c.pmace,
                num_iter,
                joint,
                Some(reg),
            ))));
        }
        solvers
    }
}

fn pmace_params(c: &PmaceConfig, num_iter: usize, joint: bool, reg: Option<RegParams>) -> PmaceParams {
    PmaceParams {
        num_iter,
        alpha: c.alpha,
        rho: c.rho,
        probe_exp: c.probe_exp,
        obj_exp: c.obj_exp,
        joint,
        probe_alpha: c.probe_alpha,
        reg,
    }
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &Path) -> Result<JobConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    JobConfig::from_toml_str(&content)
}
