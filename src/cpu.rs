//! CPU/RAM backend.
//!
//! The region lives in system memory and kernel workers are spread over a
//! pool of scoped OS threads. Each launch returns only once every thread
//! has joined, which gives the launch-boundary barrier the test phases
//! rely on.

use crate::error::DeviceError;
use crate::region::DeviceRegion;
use crate::traits::{LaunchShape, MemoryBackend};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Claims handed to each thread per launch, on average.
const CLAIMS_PER_THREAD: usize = 8;

/// CPU/RAM memory backend.
pub struct CpuBackend {
    num_threads: usize,
}

impl CpuBackend {
    /// Creates a backend using `threads` workers (defaults to CPU count).
    pub fn new(threads: Option<usize>) -> Self {
        let num_threads = threads.unwrap_or_else(num_cpus::get).max(1);
        Self { num_threads }
    }

    /// Returns the number of threads used for launches.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "CPU/RAM"
    }

    fn device_info(&self) -> String {
        format!("{} threads", self.num_threads())
    }

    fn max_testable_memory(&self) -> u64 {
        u64::MAX
    }

    fn allocate(&mut self, bytes: usize) -> Result<DeviceRegion, DeviceError> {
        let region = DeviceRegion::allocate(bytes, None)?;
        log::debug!("allocated {:?} in system memory", region);
        Ok(region)
    }

    fn release(&mut self, region: DeviceRegion) {
        log::debug!("released {:?}", region);
        drop(region);
    }

    fn launch(
        &self,
        _region: &DeviceRegion,
        shape: LaunchShape,
        kernel: &(dyn Fn(usize) + Sync),
    ) -> Result<(), DeviceError> {
        dispatch(self.num_threads, shape, kernel)
    }
}

/// Runs `kernel` once for every worker of `shape` on up to `threads` threads.
///
/// Threads claim runs of consecutive worker indices from a shared cursor, so
/// a few heavy per-block workers and millions of light stress lanes both
/// balance across the pool.
pub fn dispatch(
    threads: usize,
    shape: LaunchShape,
    kernel: &(dyn Fn(usize) + Sync),
) -> Result<(), DeviceError> {
    let total = shape.workers();
    if total == 0 {
        return Ok(());
    }
    let threads = threads.clamp(1, total);
    let claim = (total / (threads * CLAIMS_PER_THREAD)).max(1);
    let cursor = AtomicUsize::new(0);

    crossbeam::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|_| loop {
                let start = cursor.fetch_add(claim, Ordering::Relaxed);
                if start >= total {
                    break;
                }
                for worker in start..(start + claim).min(total) {
                    kernel(worker);
                }
            });
        }
    })
    .map_err(|_| DeviceError::LaunchFailed("worker thread panicked".to_string()))
}
