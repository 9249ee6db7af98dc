//! # Speckle Core
//!
//! The numerical backbone of the Speckle framework. This crate reconstructs
//! a complex transmittance image (and optionally the illuminating probe) from
//! phase-less far-field diffraction intensities recorded at overlapping scan
//! positions.
//!
//! ## Architecture
//!
//! All reconstruction methods implement the [`solver::PtychoSolver`] trait,
//! which consumes a validated [`types::PtychoProblem`] and returns a
//! [`types::Reconstruction`] with the final estimates and convergence history.
//! Every method shares the same physical model: a unitary 2D Fourier
//! transform ([`propagation`]) and the phase-preserving magnitude projection
//! ([`projection`]) applied to probe-weighted object patches ([`patch`]).
//!
//! ## Modules
//!
//! - [`types`]: measurement set, problem definition, reconstruction output.
//! - [`propagation`]: forward/inverse far-field propagator.
//! - [`patch`]: scan windows, patch extraction and overlap accumulation.
//! - [`projection`]: data-fitting magnitude projection.
//! - [`numeric`]: guarded division and instability reporting.
//! - [`monitor`]: error metrics, timing and per-iteration recording.
//! - [`prior`]: pluggable denoisers for regularised PMACE.
//! - [`init`]: formulated initial object guess.
//! - [`solver`]: ePIE, WF/AWF, SHARP/SHARP+ and PMACE/reg-PMACE.
//! - [`config`]: TOML job configuration.

pub mod config;
pub mod init;
pub mod monitor;
pub mod numeric;
pub mod patch;
pub mod prior;
pub mod projection;
pub mod propagation;
pub mod solver;
pub mod types;
