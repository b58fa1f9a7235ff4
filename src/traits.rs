//! Core traits for memory testing.
//!
//! This module defines the `MemoryBackend` trait that both the CPU and GPU
//! backends satisfy, plus the immutable configuration and per-test results
//! the driver passes around.

use crate::algorithms::MemTest;
use crate::error::{DeviceError, VramscanError};
use crate::ledger::ErrorLedger;
use crate::region::{BlockLayout, ChunkLayout, DeviceRegion, BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::report::Verbosity;
use std::time::Duration;

/// Production dwell interval of the bit-fade test.
pub const DEFAULT_BIT_FADE_DWELL: Duration = Duration::from_secs(90 * 60);

/// Blocks covered by one launch window.
pub const DEFAULT_GRID_SIZE: usize = 512;

/// Shape of one parallel launch: `groups * group_size` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchShape {
    pub groups: usize,
    pub group_size: usize,
}

impl LaunchShape {
    pub fn new(groups: usize, group_size: usize) -> Self {
        Self { groups, group_size }
    }

    /// One worker per block.
    pub fn per_block(blocks: usize) -> Self {
        Self::new(blocks, 1)
    }

    /// Default grid of the bandwidth stress test.
    pub fn stress() -> Self {
        Self::new(512, 256)
    }

    pub fn workers(&self) -> usize {
        self.groups * self.group_size
    }
}

/// Phases a backend may run with its own device code instead of the host
/// kernels in `kernels.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKernel {
    /// Fill every word of each block with `pattern`.
    MoveInvWrite { pattern: u32 },
    /// Verify `p1`, then overwrite with `p2`.
    MoveInvReadWrite { p1: u32, p2: u32 },
    /// Verify `pattern`.
    MoveInvRead { pattern: u32 },
    /// Fill every stress lane with the 64-bit `pattern`.
    StressWrite { pattern: u64 },
    /// Verify the 64-bit `p1` on every stress lane, then overwrite with `p2`.
    StressReadWrite { p1: u64, p2: u64 },
}

impl NativeKernel {
    /// True for the test 10 kernels, which run over a [`ChunkLayout`].
    pub fn is_stress(&self) -> bool {
        matches!(self, Self::StressWrite { .. } | Self::StressReadWrite { .. })
    }
}

/// Work covered by one native launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeGrid {
    /// `count` blocks of `layout` starting at block `first`.
    Blocks {
        layout: BlockLayout,
        first: usize,
        count: usize,
    },
    /// Every lane of a stress grid.
    Chunks(ChunkLayout),
}

/// Result of a single test run.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// The test that ran.
    pub test: MemTest,
    /// Pass number, starting at 0.
    pub pass: u32,
    /// Faults read back over all phases and retries.
    pub faults: u64,
    /// Duration of the test in milliseconds.
    pub duration_ms: u64,
}

/// Immutable configuration threaded through the driver and every test.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Maximum number of blocks to scan.
    pub max_blocks: usize,
    /// Block size in bytes (power of two, at least 4 KiB).
    pub block_size: usize,
    /// Passes over the enabled test suite.
    pub num_passes: u32,
    /// Internal iterations of tests 0 and 10.
    pub num_iterations: u32,
    /// Stop at the first phase that reads back faults.
    pub exit_on_error: bool,
    /// Pattern override for tests 4, 8 (low 32 bits) and 10.
    pub pattern: Option<u64>,
    /// How much the reporter prints.
    pub verbosity: Verbosity,
    /// Redraw progress in place instead of printing lines.
    pub interactive: bool,
    /// Blocks per launch window.
    pub grid_size: usize,
    /// Launch grid of the bandwidth stress test.
    pub stress_shape: LaunchShape,
    /// Sleep between bit-fade phases.
    pub bit_fade_dwell: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            max_blocks: 1024, // 1 GB default
            block_size: BLOCK_SIZE,
            num_passes: 1,
            num_iterations: 1,
            exit_on_error: false,
            pattern: None,
            verbosity: Verbosity::Quiet,
            interactive: false,
            grid_size: DEFAULT_GRID_SIZE,
            stress_shape: LaunchShape::stress(),
            bit_fade_dwell: DEFAULT_BIT_FADE_DWELL,
        }
    }
}

impl TestConfig {
    /// Checks the invariants the test algorithms depend on.
    pub fn validate(&self) -> Result<(), VramscanError> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            return Err(VramscanError::Config(format!(
                "block size must be a power of two of at least {} bytes, got {}",
                MIN_BLOCK_SIZE, self.block_size
            )));
        }
        if self.max_blocks == 0 {
            return Err(VramscanError::Config(
                "at least one block must be tested".to_string(),
            ));
        }
        if self.grid_size == 0 {
            return Err(VramscanError::Config("grid size must be non-zero".to_string()));
        }
        if self.stress_shape.workers() == 0 {
            return Err(VramscanError::Config(
                "stress launch shape must have at least one worker".to_string(),
            ));
        }
        Ok(())
    }

    /// Low 32 bits of the override pattern, for the 32-bit tests.
    pub fn pattern32(&self) -> Option<u32> {
        self.pattern.map(|p| p as u32)
    }
}

/// Device memory and parallel launch capability.
///
/// Both CPU (RAM) and GPU (VRAM) backends implement this trait, so the
/// test algorithms never know where the region physically lives.
pub trait MemoryBackend: Send + Sync {
    /// Returns the name of this backend (e.g., "CPU/RAM", "GPU/VRAM").
    fn name(&self) -> &'static str;

    /// Returns information about the device being tested.
    fn device_info(&self) -> String;

    /// Returns the maximum testable memory in bytes.
    fn max_testable_memory(&self) -> u64;

    /// Allocates a zero-filled region of `bytes` bytes.
    fn allocate(&mut self, bytes: usize) -> Result<DeviceRegion, DeviceError>;

    /// Frees a region returned by `allocate`.
    fn release(&mut self, region: DeviceRegion);

    /// Copies host words into the region (host-to-device).
    fn upload(&self, region: &DeviceRegion, offset: usize, data: &[u32]) -> Result<(), DeviceError> {
        region.copy_from_host(offset, data)
    }

    /// Makes device contents visible to kernels before a phase starts.
    fn begin_phase(&self, _region: &DeviceRegion) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Publishes kernel writes to the device after a phase completes.
    fn end_phase(&self, _region: &DeviceRegion) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Runs `kernel(worker)` for every worker of `shape` and returns once all
    /// of them have finished.
    fn launch(
        &self,
        region: &DeviceRegion,
        shape: LaunchShape,
        kernel: &(dyn Fn(usize) + Sync),
    ) -> Result<(), DeviceError>;

    /// Whether [`launch_native`](Self::launch_native) accepts `kernel`.
    fn supports_native(&self, _kernel: NativeKernel) -> bool {
        false
    }

    /// Runs `kernel` over `grid` in device code and merges the faults it
    /// found into `ledger`. Native phases work on device memory directly,
    /// without `begin_phase`/`end_phase`.
    fn launch_native(
        &self,
        _region: &DeviceRegion,
        _ledger: &ErrorLedger,
        kernel: NativeKernel,
        _grid: NativeGrid,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::LaunchFailed(format!(
            "{} has no native {:?} kernel",
            self.name(),
            kernel
        )))
    }
}
