//! Single-threaded backend, visiting frames in index order.

use ndarray::{Array3, Axis};
use num_complex::Complex64;

use crate::backend::{BackendType, ComputeBackend, ComputeError, DeviceInfo, FrameOp};

/// Backend that runs every frame operation on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl ComputeBackend for SerialBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Serial".into(),
            backend_type: BackendType::Serial,
            compute_units: Some(1),
        }
    }

    fn for_each_frame(
        &self,
        frames: &mut Array3<Complex64>,
        op: &FrameOp<'_>,
    ) -> Result<(), ComputeError> {
        for (j, frame) in frames.axis_iter_mut(Axis(0)).enumerate() {
            op(j, frame);
        }
        Ok(())
    }
}
