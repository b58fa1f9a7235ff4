//! Error types for memory testing.
//!
//! Data faults are not errors: they are recorded in the error ledger and
//! counted. The types here cover what stops a run early: configuration and
//! environment problems, device/resource failures, interrupts, and the
//! exit-on-error trigger.

use std::time::SystemTimeError;
use thiserror::Error;

/// Process exit code for configuration, environment and device failures.
pub const EXIT_GENERAL: i32 = 1;

/// Process exit code when memory faults were detected.
pub const EXIT_BAD_STATE: i32 = 2;

/// Unified error type for vramscan operations.
#[derive(Error, Debug)]
pub enum VramscanError {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The wall clock could not be read for pattern seeding.
    #[error("Time source failed: {0}")]
    TimeSource(#[from] SystemTimeError),

    /// Faults were read back while exit-on-error is set.
    #[error("{count} memory fault(s) detected during {phase}")]
    FaultsDetected { phase: String, count: u64 },

    /// A stop was requested; the run ended at a phase boundary.
    #[error("Run interrupted before {phase}")]
    Interrupted { phase: String },

    /// Device memory or launch failure.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl VramscanError {
    /// Maps the error onto the process exit code reported to the caller.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FaultsDetected { .. } => EXIT_BAD_STATE,
            _ => EXIT_GENERAL,
        }
    }
}

/// Device-level failures: allocation, copies, launches.
#[derive(Error, Debug)]
#[allow(dead_code)] // Several variants only occur with the gpu feature.
pub enum DeviceError {
    /// No GPU adapter found.
    #[error("No GPU adapter found")]
    NoAdapter,

    /// Specified GPU adapter not found.
    #[error("GPU adapter {index} not found (available: {available:?})")]
    AdapterNotFound {
        index: usize,
        available: Vec<String>,
    },

    /// Failed to request GPU device.
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// Region allocation failed.
    #[error("Buffer allocation failed: requested {requested_mb}MB")]
    BufferAllocation { requested_mb: u64 },

    /// Staging buffer mapping failed.
    #[error("Buffer mapping failed: {0}")]
    BufferMapping(String),

    /// Device readback timed out.
    #[error("GPU operation timed out after {0} seconds")]
    Timeout(u64),

    /// The requested region does not fit the device.
    #[error("Insufficient VRAM: need {needed_mb}MB, device allows {available_mb}MB")]
    InsufficientVram { needed_mb: u64, available_mb: u64 },

    /// A compute shader failed validation.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// A kernel launch did not complete.
    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),

    /// A host/device copy touched words outside the region.
    #[error("Copy of {len} words at word offset {offset} exceeds region of {region_words} words")]
    OutOfRange {
        offset: usize,
        len: usize,
        region_words: usize,
    },
}
