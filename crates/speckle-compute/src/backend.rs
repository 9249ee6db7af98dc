//! Compute backend trait and device abstraction.
//!
//! The [`ComputeBackend`] trait abstracts over execution strategies so that
//! the solvers in `speckle-core` remain agnostic to how the per-measurement
//! work of a batch iteration is scheduled.

use ndarray::{Array3, ArrayViewMut2};
use num_complex::Complex64;
use thiserror::Error;

/// Errors originating from compute backends.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend_type: BackendType,
    pub compute_units: Option<usize>,
}

/// The type of compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Serial,
    Cpu,
}

/// A per-frame operation: receives the measurement index and a mutable view
/// of that measurement's frame.
pub type FrameOp<'f> = dyn Fn(usize, ArrayViewMut2<'_, Complex64>) + Send + Sync + 'f;

/// Abstraction over compute backends.
///
/// Implementations must call `op` exactly once per frame and must not share a
/// frame between tasks. Any reduction across frames is left to the caller,
/// which performs it in index order after the fan-out completes.
pub trait ComputeBackend: Send + Sync {
    /// Return information about the device.
    fn device_info(&self) -> DeviceInfo;

    /// Apply `op` to every frame (axis 0) of `frames`.
    fn for_each_frame(
        &self,
        frames: &mut Array3<Complex64>,
        op: &FrameOp<'_>,
    ) -> Result<(), ComputeError>;

    /// Allocate a `(count, rows, cols)` stack and fill each frame with `fill`.
    fn fill_frames(
        &self,
        count: usize,
        shape: (usize, usize),
        fill: &FrameOp<'_>,
    ) -> Result<Array3<Complex64>, ComputeError> {
        let mut frames = Array3::<Complex64>::zeros((count, shape.0, shape.1));
        self.for_each_frame(&mut frames, fill)?;
        Ok(frames)
    }
}
