//! # Speckle Compute
//!
//! Compute backend abstraction for the Speckle framework. Batch solvers
//! (WF, SHARP, PMACE) perform the same independent operation on every
//! measurement frame; this crate provides a [`ComputeBackend`](backend::ComputeBackend)
//! trait that isolates that per-frame fan-out from the reconstruction code.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Notes |
//! |---------|-------------|--------|
//! | Serial | always | Reference ordering, no threads |
//! | CPU (Rayon) | `cpu` (default) | One task per frame |
//!
//! Every backend writes frame `j` only from the task that owns index `j`, so
//! results are identical across backends.

pub mod backend;
pub mod serial;

#[cfg(feature = "cpu")]
pub mod cpu;

pub use backend::{BackendType, ComputeBackend, ComputeError, DeviceInfo, FrameOp};
pub use serial::SerialBackend;

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;

/// The backend used when a solver is not given one explicitly.
#[cfg(feature = "cpu")]
pub fn default_backend() -> std::sync::Arc<dyn ComputeBackend> {
    std::sync::Arc::new(CpuBackend::new())
}

/// The backend used when a solver is not given one explicitly.
#[cfg(not(feature = "cpu"))]
pub fn default_backend() -> std::sync::Arc<dyn ComputeBackend> {
    std::sync::Arc::new(SerialBackend)
}
