//! Test driver: registry of enabled tests, region lifecycle and passes.

use crate::algorithms::{MemTest, TestContext};
use crate::error::VramscanError;
use crate::ledger::{ErrorLedger, MAX_ERR_RECORD_COUNT};
use crate::region::BlockLayout;
use crate::report::{Reporter, Verbosity};
use crate::stats::TestStats;
use crate::traits::{MemoryBackend, TestConfig, TestResult};
use bytesize::ByteSize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A registered test and whether it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestDescriptor {
    pub test: MemTest,
    pub enabled: bool,
}

impl TestDescriptor {
    pub fn name(&self) -> &'static str {
        self.test.name()
    }
}

/// The eleven tests in registration order, with their enabled flags.
#[derive(Debug, Clone)]
pub struct TestRegistry {
    descriptors: Vec<TestDescriptor>,
}

impl TestRegistry {
    /// Registry with each test's default flag.
    pub fn new() -> Self {
        Self {
            descriptors: MemTest::all()
                .into_iter()
                .map(|test| TestDescriptor {
                    test,
                    enabled: test.enabled_by_default(),
                })
                .collect(),
        }
    }

    pub fn descriptors(&self) -> &[TestDescriptor] {
        &self.descriptors
    }

    pub fn disable_all(&mut self) {
        for descriptor in &mut self.descriptors {
            descriptor.enabled = false;
        }
    }

    pub fn enable(&mut self, index: usize) -> Result<(), VramscanError> {
        self.set(index, true)
    }

    pub fn disable(&mut self, index: usize) -> Result<(), VramscanError> {
        self.set(index, false)
    }

    fn set(&mut self, index: usize, enabled: bool) -> Result<(), VramscanError> {
        let count = self.descriptors.len();
        let test = MemTest::from_index(index).ok_or_else(|| {
            VramscanError::Config(format!(
                "test index {} out of range (0..{})",
                index, count
            ))
        })?;
        for descriptor in self.descriptors.iter_mut().filter(|d| d.test == test) {
            descriptor.enabled = enabled;
        }
        Ok(())
    }

    /// Applies overrides in order: disable-all, then enables, then disables.
    pub fn apply(
        &mut self,
        disable_all: bool,
        enables: &[usize],
        disables: &[usize],
    ) -> Result<(), VramscanError> {
        if disable_all {
            self.disable_all();
        }
        for &index in enables {
            self.enable(index)?;
        }
        for &index in disables {
            self.disable(index)?;
        }
        Ok(())
    }

    /// Enabled tests in registration order.
    pub fn enabled(&self) -> Vec<MemTest> {
        self.descriptors
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.test)
            .collect()
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub results: Vec<TestResult>,
    pub blocks: usize,
    pub region_bytes: u64,
    pub duration: Duration,
}

impl RunSummary {
    pub fn total_faults(&self) -> u64 {
        self.results.iter().map(|r| r.faults).sum()
    }

    pub fn has_faults(&self) -> bool {
        self.total_faults() > 0
    }
}

/// Runs the enabled tests over one region allocated from a backend.
pub struct TestDriver {
    backend: Box<dyn MemoryBackend>,
    config: TestConfig,
    registry: TestRegistry,
    reporter: Box<dyn Reporter>,
}

impl TestDriver {
    pub fn new(
        backend: Box<dyn MemoryBackend>,
        config: TestConfig,
        registry: TestRegistry,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        Self {
            backend,
            config,
            registry,
            reporter,
        }
    }

    /// Blocks to scan: the configured maximum, capped by what the backend can hold.
    pub fn plan_blocks(&self) -> Result<usize, VramscanError> {
        let fits = self.backend.max_testable_memory() / self.config.block_size as u64;
        let blocks = (self.config.max_blocks as u64).min(fits) as usize;
        if blocks == 0 {
            return Err(VramscanError::Config(format!(
                "{} cannot hold a single {} block",
                self.backend.name(),
                ByteSize::b(self.config.block_size as u64)
            )));
        }
        Ok(blocks)
    }

    /// Runs `num_passes` passes over the enabled tests.
    ///
    /// The region and ledger are allocated once up front and the region is
    /// released again before returning, whether or not the run succeeded.
    pub fn run(
        &mut self,
        stats: Arc<TestStats>,
        should_stop: Arc<AtomicBool>,
    ) -> Result<RunSummary, VramscanError> {
        self.config.validate()?;
        let enabled = self.registry.enabled();
        if enabled.is_empty() {
            return Err(VramscanError::Config("no tests enabled".to_string()));
        }

        let blocks = self.plan_blocks()?;
        let layout = BlockLayout::new(self.config.block_size, blocks);
        let region = self.backend.allocate(layout.region_bytes())?;
        let ledger = ErrorLedger::new(MAX_ERR_RECORD_COUNT);
        log::debug!("region base {:#x}, {} bytes", region.base(), region.len_bytes());
        self.reporter.message(
            Verbosity::Quiet,
            &format!(
                "Testing {} blocks of {} ({}) on {} [{}]",
                blocks,
                ByteSize::b(self.config.block_size as u64),
                ByteSize::b(layout.region_bytes() as u64),
                self.backend.name(),
                self.backend.device_info()
            ),
        );

        let started = Instant::now();
        let ctx = TestContext {
            backend: self.backend.as_ref(),
            region: &region,
            layout,
            ledger: &ledger,
            config: &self.config,
            reporter: self.reporter.as_ref(),
            stats: &stats,
            should_stop: &should_stop,
        };
        let outcome = run_passes(&ctx, &enabled);
        drop(ctx);
        self.backend.release(region);
        let results = outcome?;

        self.reporter.message(
            Verbosity::Quiet,
            &format!("{} tests complete", results.len()),
        );
        Ok(RunSummary {
            results,
            blocks,
            region_bytes: layout.region_bytes() as u64,
            duration: started.elapsed(),
        })
    }
}

fn run_passes(ctx: &TestContext, enabled: &[MemTest]) -> Result<Vec<TestResult>, VramscanError> {
    let mut results = Vec::new();
    for pass in 0..ctx.config.num_passes {
        for &test in enabled {
            ctx.reporter.message(
                Verbosity::Quiet,
                &format!("{} starting (pass {})", test.name(), pass),
            );
            let started = Instant::now();
            let faults = test.run(ctx)?;
            let duration = started.elapsed();
            ctx.stats.add_test();
            ctx.reporter.message(
                Verbosity::Quiet,
                &format!(
                    "{} {} in {}",
                    test.name(),
                    if faults == 0 { "passed" } else { "FAILED" },
                    humantime::format_duration(Duration::from_millis(duration.as_millis() as u64))
                ),
            );
            results.push(TestResult {
                test,
                pass,
                faults,
                duration_ms: duration.as_millis() as u64,
            });
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::error::DeviceError;
    use crate::region::{DeviceRegion, MIN_BLOCK_SIZE};
    use crate::report::CaptureReporter;
    use crate::traits::LaunchShape;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn small_config() -> TestConfig {
        TestConfig {
            max_blocks: 4,
            block_size: MIN_BLOCK_SIZE,
            stress_shape: LaunchShape::new(4, 8),
            bit_fade_dwell: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Reporter that shares its capture with the test.
    struct SharedReporter(Arc<CaptureReporter>);

    impl Reporter for SharedReporter {
        fn message(&self, level: Verbosity, text: &str) {
            self.0.message(level, text)
        }

        fn progress(&self, phase: &str, finished: usize, total: usize) {
            self.0.progress(phase, finished, total)
        }

        fn faults(&self, phase: &str, readout: &crate::ledger::LedgerReadout) {
            self.0.faults(phase, readout)
        }
    }

    /// CPU backend with a small capacity that tracks live allocations.
    struct TrackingBackend {
        inner: CpuBackend,
        capacity: u64,
        live: Arc<AtomicUsize>,
        sizes: Arc<Mutex<Vec<usize>>>,
    }

    impl TrackingBackend {
        fn new(capacity: u64) -> Self {
            Self {
                inner: CpuBackend::new(Some(2)),
                capacity,
                live: Arc::new(AtomicUsize::new(0)),
                sizes: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl MemoryBackend for TrackingBackend {
        fn name(&self) -> &'static str {
            "tracking"
        }

        fn device_info(&self) -> String {
            "test device".to_string()
        }

        fn max_testable_memory(&self) -> u64 {
            self.capacity
        }

        fn allocate(&mut self, bytes: usize) -> Result<DeviceRegion, DeviceError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(bytes);
            self.inner.allocate(bytes)
        }

        fn release(&mut self, region: DeviceRegion) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.release(region)
        }

        fn launch(
            &self,
            region: &DeviceRegion,
            shape: LaunchShape,
            kernel: &(dyn Fn(usize) + Sync),
        ) -> Result<(), DeviceError> {
            self.inner.launch(region, shape, kernel)
        }
    }

    fn run_driver(
        backend: TrackingBackend,
        config: TestConfig,
        registry: TestRegistry,
        stop: bool,
    ) -> (Result<RunSummary, VramscanError>, Arc<CaptureReporter>) {
        let capture = Arc::new(CaptureReporter::default());
        let mut driver = TestDriver::new(
            Box::new(backend),
            config,
            registry,
            Box::new(SharedReporter(Arc::clone(&capture))),
        );
        let result = driver.run(Arc::new(TestStats::new()), Arc::new(AtomicBool::new(stop)));
        (result, capture)
    }

    #[test]
    fn test_registry_defaults() {
        let registry = TestRegistry::new();
        assert_eq!(registry.descriptors().len(), 11);
        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 10);
        assert!(!enabled.contains(&MemTest::Test9));
        assert_eq!(registry.descriptors()[3].name(), MemTest::Test3.name());
    }

    #[test]
    fn test_registry_override_order() {
        let mut registry = TestRegistry::new();
        registry.apply(true, &[2, 9, 4], &[4]).unwrap();
        assert_eq!(registry.enabled(), vec![MemTest::Test2, MemTest::Test9]);
    }

    #[test]
    fn test_registry_invalid_index() {
        let mut registry = TestRegistry::new();
        assert!(matches!(registry.enable(11), Err(VramscanError::Config(_))));
        assert!(registry.disable(99).is_err());
    }

    #[test]
    fn test_plan_blocks_capped_by_backend() {
        let driver = TestDriver::new(
            Box::new(TrackingBackend::new(3 * MIN_BLOCK_SIZE as u64 + 100)),
            small_config(),
            TestRegistry::new(),
            Box::new(CaptureReporter::default()),
        );
        assert_eq!(driver.plan_blocks().unwrap(), 3);
    }

    #[test]
    fn test_plan_blocks_too_small() {
        let driver = TestDriver::new(
            Box::new(TrackingBackend::new(100)),
            small_config(),
            TestRegistry::new(),
            Box::new(CaptureReporter::default()),
        );
        assert!(matches!(driver.plan_blocks(), Err(VramscanError::Config(_))));
    }

    #[test]
    fn test_full_suite_clean_run() {
        let backend = TrackingBackend::new(u64::MAX);
        let live = Arc::clone(&backend.live);
        let sizes = Arc::clone(&backend.sizes);
        let mut registry = TestRegistry::new();
        registry.enable(9).unwrap();
        let config = TestConfig {
            num_passes: 2,
            ..small_config()
        };

        let (result, capture) = run_driver(backend, config, registry, false);
        let summary = result.unwrap();
        assert_eq!(summary.results.len(), 22);
        assert_eq!(summary.total_faults(), 0);
        assert!(!summary.has_faults());
        assert_eq!(summary.blocks, 4);
        assert_eq!(summary.results[11].pass, 1);
        assert_eq!(summary.results[11].test, MemTest::Test0);

        // One allocation for the whole run, released at the end.
        assert_eq!(*sizes.lock().unwrap(), vec![4 * MIN_BLOCK_SIZE]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(capture.messages().contains(&"22 tests complete".to_string()));
    }

    #[test]
    fn test_region_released_on_error() {
        let backend = TrackingBackend::new(u64::MAX);
        let live = Arc::clone(&backend.live);
        let (result, capture) = run_driver(backend, small_config(), TestRegistry::new(), true);
        assert!(matches!(result, Err(VramscanError::Interrupted { .. })));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!capture.messages().iter().any(|m| m.ends_with("tests complete")));
    }

    #[test]
    fn test_no_tests_enabled() {
        let mut registry = TestRegistry::new();
        registry.disable_all();
        let (result, _) = run_driver(TrackingBackend::new(u64::MAX), small_config(), registry, false);
        assert!(matches!(result, Err(VramscanError::Config(_))));
    }

    #[test]
    fn test_invalid_config_rejected_before_allocation() {
        let backend = TrackingBackend::new(u64::MAX);
        let sizes = Arc::clone(&backend.sizes);
        let config = TestConfig {
            block_size: 5000,
            ..small_config()
        };
        let (result, _) = run_driver(backend, config, TestRegistry::new(), false);
        assert!(result.is_err());
        assert!(sizes.lock().unwrap().is_empty());
    }
}
