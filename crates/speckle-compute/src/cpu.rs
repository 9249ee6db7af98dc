//! CPU compute backend using Rayon for shared-memory parallelism.

use ndarray::parallel::prelude::*;
use ndarray::{Array3, Axis};
use num_complex::Complex64;

use crate::backend::{BackendType, ComputeBackend, ComputeError, DeviceInfo, FrameOp};

/// CPU backend that parallelises frame operations across threads via Rayon.
pub struct CpuBackend {
    num_threads: usize,
    pool: Option<rayon::ThreadPool>,
}

impl CpuBackend {
    /// Create a new CPU backend on the global Rayon pool.
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            pool: None,
        }
    }

    /// Create a CPU backend with a dedicated pool of `num_threads` threads.
    pub fn with_threads(num_threads: usize) -> Result<Self, ComputeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| ComputeError::ThreadPool(e.to_string()))?;
        Ok(Self {
            num_threads,
            pool: Some(pool),
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("CPU ({} threads)", self.num_threads),
            backend_type: BackendType::Cpu,
            compute_units: Some(self.num_threads),
        }
    }

    fn for_each_frame(
        &self,
        frames: &mut Array3<Complex64>,
        op: &FrameOp<'_>,
    ) -> Result<(), ComputeError> {
        let mut run = || {
            frames
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(j, frame)| op(j, frame));
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SerialBackend;

    #[test]
    fn test_matches_serial_backend() {
        fn fill(j: usize, mut frame: ndarray::ArrayViewMut2<'_, Complex64>) {
            for ((r, c), v) in frame.indexed_iter_mut() {
                *v = Complex64::new((j * 100 + r * 10 + c) as f64, -(j as f64));
            }
        }
        let serial = SerialBackend.fill_frames(16, (3, 5), &fill).unwrap();
        let parallel = CpuBackend::with_threads(4)
            .unwrap()
            .fill_frames(16, (3, 5), &fill)
            .unwrap();
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_device_info_reports_threads() {
        let backend = CpuBackend::with_threads(2).unwrap();
        let info = backend.device_info();
        assert_eq!(info.backend_type, BackendType::Cpu);
        assert_eq!(info.compute_units, Some(2));
    }
}
