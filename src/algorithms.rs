//! Test algorithms 0 through 10.
//!
//! Each test sequences kernel phases over the whole region through a
//! [`TestContext`]. A phase is one or more launch windows of
//! `grid_size` blocks; the ledger is read back only between phases, which
//! is also the only place a run can stop early.

use crate::error::VramscanError;
use crate::kernels;
use crate::ledger::ErrorLedger;
use crate::patterns::{
    complement, random_block, random_pattern32, random_pattern64, replicate_byte, AddressWalk,
    RotatingPattern, MOD_SZ,
};
use crate::region::{BlockLayout, BlockRange, ChunkLayout, DeviceRegion, WORD_BYTES};
use crate::report::{Reporter, Verbosity};
use crate::stats::TestStats;
use crate::traits::{LaunchShape, MemoryBackend, NativeGrid, NativeKernel, TestConfig};
use bytesize::ByteSize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Retries granted to tests with a repeat-on-fault policy.
pub const MAX_ITERATION: u32 = 3;

/// Longest uninterrupted sleep of the bit-fade dwell.
const DWELL_SLICE: Duration = Duration::from_millis(500);

/// The eleven memory tests, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemTest {
    Test0,
    Test1,
    Test2,
    Test3,
    Test4,
    Test5,
    Test6,
    Test7,
    Test8,
    Test9,
    Test10,
}

impl MemTest {
    /// Returns every test in registration order.
    pub fn all() -> Vec<Self> {
        vec![
            Self::Test0,
            Self::Test1,
            Self::Test2,
            Self::Test3,
            Self::Test4,
            Self::Test5,
            Self::Test6,
            Self::Test7,
            Self::Test8,
            Self::Test9,
            Self::Test10,
        ]
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    /// Returns the human-readable name of this test.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Test0 => "Test0 [Walking 1 bit]",
            Self::Test1 => "Test1 [Own address test]",
            Self::Test2 => "Test2 [Moving inversions, ones&zeros]",
            Self::Test3 => "Test3 [Moving inversions, 8 bit pat]",
            Self::Test4 => "Test4 [Moving inversions, random pattern]",
            Self::Test5 => "Test5 [Block move, 64 moves]",
            Self::Test6 => "Test6 [Moving inversions, 32 bit pat]",
            Self::Test7 => "Test7 [Random number sequence]",
            Self::Test8 => "Test8 [Modulo 20, random pattern]",
            Self::Test9 => "Test9 [Bit fade test, 2 patterns]",
            Self::Test10 => "Test10 [Memory stress test]",
        }
    }

    /// Bit fade sleeps for hours, so it only runs when asked for.
    pub fn enabled_by_default(&self) -> bool {
        !matches!(self, Self::Test9)
    }

    /// Runs the test once and returns the faults it read back.
    pub fn run(&self, ctx: &TestContext) -> Result<u64, VramscanError> {
        match self {
            Self::Test0 => address_walk(ctx),
            Self::Test1 => own_address(ctx),
            Self::Test2 => moving_inversions_ones_zeros(ctx),
            Self::Test3 => moving_inversions_8bit(ctx),
            Self::Test4 => moving_inversions_random(ctx),
            Self::Test5 => block_move(ctx),
            Self::Test6 => moving_inversions_32bit(ctx),
            Self::Test7 => random_sequence(ctx),
            Self::Test8 => modulo_20(ctx),
            Self::Test9 => bit_fade(ctx),
            Self::Test10 => stress(ctx),
        }
    }
}

/// Everything a test borrows for the duration of one run.
pub struct TestContext<'a> {
    pub backend: &'a dyn MemoryBackend,
    pub region: &'a DeviceRegion,
    pub layout: BlockLayout,
    pub ledger: &'a ErrorLedger,
    pub config: &'a TestConfig,
    pub reporter: &'a dyn Reporter,
    pub stats: &'a TestStats,
    pub should_stop: &'a AtomicBool,
}

impl TestContext<'_> {
    fn ensure_running(&self, phase: &str) -> Result<(), VramscanError> {
        if self.should_stop.load(Ordering::SeqCst) {
            return Err(VramscanError::Interrupted {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }

    fn pattern_message(&self, text: String) {
        self.reporter.message(Verbosity::Patterns, &text);
    }

    /// Runs `kernel` once per block, one launch window of `grid_size` blocks
    /// at a time, and reports progress after every window.
    pub fn run_blocks<K>(&self, phase: &str, kernel: K) -> Result<(), VramscanError>
    where
        K: Fn(BlockRange) + Sync,
    {
        self.run_blocks_from(phase, 0, kernel)
    }

    /// Like [`run_blocks`](Self::run_blocks), skipping the blocks before `first`.
    pub fn run_blocks_from<K>(&self, phase: &str, first: usize, kernel: K) -> Result<(), VramscanError>
    where
        K: Fn(BlockRange) + Sync,
    {
        self.ensure_running(phase)?;
        let started = Instant::now();
        self.backend.begin_phase(self.region)?;

        let total = self.layout.total_blocks();
        let grid = self.config.grid_size;
        let layout = self.layout;
        for start in (first..total).step_by(grid) {
            self.backend
                .launch(self.region, LaunchShape::per_block(grid), &|w| {
                    if let Some(block) = layout.block(start + w) {
                        kernel(block);
                    }
                })?;
            self.reporter
                .progress(phase, (start + grid).min(total), total);
        }

        self.backend.end_phase(self.region)?;
        self.finish_phase(phase, started, self.block_bytes(first));
        Ok(())
    }

    /// Runs a per-block phase in device code when the backend supports
    /// `native`, and through `host` otherwise. Windows and progress are the
    /// same on both paths.
    fn run_native_blocks<K>(&self, phase: &str, native: NativeKernel, host: K) -> Result<(), VramscanError>
    where
        K: Fn(BlockRange) + Sync,
    {
        if !self.backend.supports_native(native) {
            return self.run_blocks(phase, host);
        }
        self.ensure_running(phase)?;
        let started = Instant::now();

        let total = self.layout.total_blocks();
        let grid = self.config.grid_size;
        for start in (0..total).step_by(grid) {
            let window = NativeGrid::Blocks {
                layout: self.layout,
                first: start,
                count: grid,
            };
            self.backend
                .launch_native(self.region, self.ledger, native, window)?;
            self.reporter
                .progress(phase, (start + grid).min(total), total);
        }

        self.finish_phase(phase, started, self.block_bytes(0));
        Ok(())
    }

    /// Runs `kernel` for every worker of `shape` in a single launch.
    /// `bytes` is the amount of memory the workers touch.
    pub fn run_workers<K>(
        &self,
        phase: &str,
        shape: LaunchShape,
        bytes: u64,
        kernel: K,
    ) -> Result<(), VramscanError>
    where
        K: Fn(usize) + Sync,
    {
        self.ensure_running(phase)?;
        let started = Instant::now();
        self.backend.begin_phase(self.region)?;
        self.backend.launch(self.region, shape, &kernel)?;
        self.backend.end_phase(self.region)?;
        self.finish_phase(phase, started, bytes);
        Ok(())
    }

    /// Runs a stress phase over `chunks`, natively when the backend supports it.
    fn run_stress<K>(
        &self,
        phase: &str,
        chunks: ChunkLayout,
        native: NativeKernel,
        host: K,
    ) -> Result<(), VramscanError>
    where
        K: Fn(usize) + Sync,
    {
        if !self.backend.supports_native(native) {
            return self.run_workers(phase, self.config.stress_shape, chunks.covered_bytes(), host);
        }
        self.ensure_running(phase)?;
        let started = Instant::now();
        self.backend
            .launch_native(self.region, self.ledger, native, NativeGrid::Chunks(chunks))?;
        self.finish_phase(phase, started, chunks.covered_bytes());
        Ok(())
    }

    /// Bytes covered by the blocks from `first` to the region end.
    fn block_bytes(&self, first: usize) -> u64 {
        (self.layout.total_blocks().saturating_sub(first) * self.layout.block_size()) as u64
    }

    fn finish_phase(&self, phase: &str, started: Instant, bytes: u64) {
        self.stats.add_phase();
        self.stats.add_bytes(bytes);
        log::debug!("{} finished in {:?}", phase, started.elapsed());
    }

    /// Drains the ledger, reports any faults and applies exit-on-error.
    pub fn check_faults(&self, phase: &str) -> Result<u64, VramscanError> {
        let readout = self.ledger.read_and_reset();
        if readout.is_clean() {
            return Ok(0);
        }
        if readout.dropped() > 0 {
            log::warn!(
                "{}: {} fault record(s) overwritten, count is still exact",
                phase,
                readout.dropped()
            );
        }
        self.reporter.faults(phase, &readout);
        self.stats.add_faults(readout.total);
        if self.config.exit_on_error {
            return Err(VramscanError::FaultsDetected {
                phase: phase.to_string(),
                count: readout.total,
            });
        }
        Ok(readout.total)
    }

    /// Sleeps for the bit-fade dwell, waking regularly to honor a stop request.
    fn dwell(&self, phase: &str) -> Result<(), VramscanError> {
        let dwell = self.config.bit_fade_dwell;
        self.pattern_message(format!(
            "{}: sleeping for {}",
            phase,
            humantime::format_duration(dwell)
        ));
        let deadline = Instant::now() + dwell;
        loop {
            self.ensure_running(phase)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(DWELL_SLICE.min(deadline - now));
        }
    }
}

/// Repeats `attempt` while it reports faults, at most `MAX_ITERATION` extra times.
fn with_retries<F>(name: &str, mut attempt: F) -> Result<u64, VramscanError>
where
    F: FnMut() -> Result<u64, VramscanError>,
{
    let mut total = 0;
    for iteration in 0..=MAX_ITERATION {
        let found = attempt()?;
        total += found;
        if found == 0 {
            break;
        }
        if iteration < MAX_ITERATION {
            log::warn!(
                "{}: {} fault(s) found, repeating ({}/{})",
                name,
                found,
                iteration + 1,
                MAX_ITERATION
            );
        }
    }
    Ok(total)
}

fn address_walk(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let mut faults = ctx.check_faults("test0 start")?;

    let probes: Vec<(u64, u32)> = AddressWalk::new(0, ctx.layout.region_bytes() as u64).collect();
    let shape = LaunchShape::per_block(probes.len());
    let probe_bytes = (probes.len() * WORD_BYTES) as u64;
    ctx.run_workers("test0 global write", shape, probe_bytes, |w| {
        if let Some(&probe) = probes.get(w) {
            kernels::address_walk_write(region, probe);
        }
    })?;
    ctx.run_workers("test0 global read", shape, probe_bytes, |w| {
        if let Some(&probe) = probes.get(w) {
            kernels::address_walk_read(region, ledger, probe);
        }
    })?;
    faults += ctx.check_faults("test0 global")?;

    for iteration in 0..ctx.config.num_iterations {
        ctx.pattern_message(format!("test0: per-block walk, iteration {}", iteration));
        ctx.run_blocks("test0 write", |b| kernels::address_walk_block_write(region, b))?;
        ctx.run_blocks("test0 read", |b| kernels::address_walk_block_read(region, ledger, b))?;
    }
    faults += ctx.check_faults("test0")?;
    Ok(faults)
}

fn own_address(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    ctx.run_blocks("test1 write", |b| kernels::own_address_write(region, b))?;
    ctx.run_blocks("test1 read", |b| kernels::own_address_read(region, ctx.ledger, b))?;
    ctx.check_faults("test1")
}

/// Write `p1`, verify `p1` while writing `p2`, verify `p2`.
fn move_inv(ctx: &TestContext, name: &str, p1: u32, p2: u32) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    ctx.pattern_message(format!("{}: pattern {:#010x} -> {:#010x}", name, p1, p2));

    let write = format!("{} write", name);
    ctx.run_native_blocks(&write, NativeKernel::MoveInvWrite { pattern: p1 }, |b| {
        kernels::move_inv_write(region, b, p1)
    })?;
    let mut faults = ctx.check_faults(&write)?;

    let readwrite = format!("{} readwrite", name);
    ctx.run_native_blocks(&readwrite, NativeKernel::MoveInvReadWrite { p1, p2 }, |b| {
        kernels::move_inv_readwrite(region, ledger, b, p1, p2)
    })?;
    faults += ctx.check_faults(&readwrite)?;

    let read = format!("{} read", name);
    ctx.run_native_blocks(&read, NativeKernel::MoveInvRead { pattern: p2 }, |b| {
        kernels::move_inv_read(region, ledger, b, p2)
    })?;
    faults += ctx.check_faults(&read)?;
    Ok(faults)
}

fn moving_inversions_ones_zeros(ctx: &TestContext) -> Result<u64, VramscanError> {
    let (p1, p2) = (0, u32::MAX);
    Ok(move_inv(ctx, "test2", p1, p2)? + move_inv(ctx, "test2", p2, p1)?)
}

fn moving_inversions_8bit(ctx: &TestContext) -> Result<u64, VramscanError> {
    let p1 = replicate_byte(0x80);
    let p2 = complement(p1);
    Ok(move_inv(ctx, "test3", p1, p2)? + move_inv(ctx, "test3", p2, p1)?)
}

fn moving_inversions_random(ctx: &TestContext) -> Result<u64, VramscanError> {
    let p1 = match ctx.config.pattern32() {
        Some(p) => p,
        None => random_pattern32()?,
    };
    with_retries("test4", || move_inv(ctx, "test4", p1, complement(p1)))
}

fn block_move(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    ctx.run_blocks("test5 init", |b| kernels::block_move_init(region, b))?;
    ctx.run_blocks("test5 move", |b| kernels::block_move_shift(region, b))?;
    ctx.run_blocks("test5 check", |b| kernels::block_move_check(region, ctx.ledger, b))?;
    ctx.check_faults("test5")
}

fn moving_inversions_32bit(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let mut faults = 0;
    for offset in 0..32 {
        for seq in [RotatingPattern::ones(offset), RotatingPattern::zeros(offset)] {
            ctx.pattern_message(format!(
                "test6: offset {}, pattern {:#010x}",
                offset,
                seq.current()
            ));
            ctx.run_blocks("test6 write", |b| kernels::movinv32_write(region, b, seq))?;
            ctx.run_blocks("test6 readwrite", |b| {
                kernels::movinv32_readwrite(region, ledger, b, seq)
            })?;
            faults += ctx.check_faults("test6 readwrite")?;
            ctx.run_blocks("test6 read", |b| kernels::movinv32_read(region, ledger, b, seq))?;
            faults += ctx.check_faults("test6 read")?;
        }
    }
    Ok(faults)
}

fn random_sequence(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let Some(seed) = ctx.layout.block(0) else {
        return Ok(0);
    };
    let data = random_block(seed.len_words())?;

    with_retries("test7", || {
        ctx.backend.upload(region, seed.start_word, &data)?;
        // Block 0 holds the seed and is only read.
        ctx.run_blocks_from("test7 write", 1, |b| kernels::random_seq_write(region, b, seed))?;
        ctx.run_blocks_from("test7 readwrite", 1, |b| {
            kernels::random_seq_readwrite(region, ledger, b, seed)
        })?;
        let mut faults = ctx.check_faults("test7 readwrite")?;
        ctx.run_blocks_from("test7 read", 1, |b| kernels::random_seq_read(region, ledger, b, seed))?;
        faults += ctx.check_faults("test7 read")?;
        Ok(faults)
    })
}

fn modulo_20(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let p1 = match ctx.config.pattern32() {
        Some(p) => p,
        None => random_pattern32()?,
    };
    let p2 = complement(p1);

    with_retries("test8", || {
        let mut faults = 0;
        for offset in 0..MOD_SZ {
            ctx.pattern_message(format!("test8: offset {}, pattern {:#010x}", offset, p1));
            ctx.run_blocks("test8 write", |b| kernels::modulo_write(region, b, offset, p1, p2))?;
            ctx.run_blocks("test8 read", |b| kernels::modulo_read(region, ledger, b, offset, p1))?;
            faults += ctx.check_faults("test8")?;
        }
        Ok(faults)
    })
}

fn bit_fade(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let (p1, p2) = (0, u32::MAX);

    ctx.run_native_blocks("test9 write", NativeKernel::MoveInvWrite { pattern: p1 }, |b| {
        kernels::move_inv_write(region, b, p1)
    })?;
    let mut faults = ctx.check_faults("test9 write")?;
    ctx.dwell("test9")?;
    ctx.run_native_blocks("test9 readwrite", NativeKernel::MoveInvReadWrite { p1, p2 }, |b| {
        kernels::move_inv_readwrite(region, ledger, b, p1, p2)
    })?;
    faults += ctx.check_faults("test9 readwrite")?;
    ctx.dwell("test9")?;
    ctx.run_native_blocks("test9 read", NativeKernel::MoveInvRead { pattern: p2 }, |b| {
        kernels::move_inv_read(region, ledger, b, p2)
    })?;
    faults += ctx.check_faults("test9 read")?;
    Ok(faults)
}

fn stress(ctx: &TestContext) -> Result<u64, VramscanError> {
    let region = ctx.region;
    let ledger = ctx.ledger;
    let shape = ctx.config.stress_shape;
    let chunks = ChunkLayout::new(ctx.layout.region_bytes(), shape.groups, shape.group_size);
    let mut p1 = match ctx.config.pattern {
        Some(p) => p,
        None => random_pattern64()?,
    };
    let mut p2 = complement(p1);
    ctx.pattern_message(format!("test10: pattern {:#018x}", p1));

    let started = Instant::now();
    ctx.run_stress("test10 write", chunks, NativeKernel::StressWrite { pattern: p1 }, |w| {
        if let Some(lane) = chunks.lane(w) {
            kernels::stress_write(region, lane, p1);
        }
    })?;
    let iterations = ctx.config.num_iterations;
    for _ in 0..iterations {
        let (old, new) = (p1, p2);
        let toggle = NativeKernel::StressReadWrite { p1: old, p2: new };
        ctx.run_stress("test10 readwrite", chunks, toggle, |w| {
            if let Some(lane) = chunks.lane(w) {
                kernels::stress_readwrite(region, ledger, lane, old, new);
            }
        })?;
        std::mem::swap(&mut p1, &mut p2);
    }
    let elapsed = started.elapsed();
    let faults = ctx.check_faults("test10")?;

    let moved = (2 * iterations as u64 + 1) * chunks.covered_bytes();
    let per_second = moved as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    ctx.reporter.message(
        Verbosity::Quiet,
        &format!(
            "test10: {} moved in {:?}, bandwidth {}/s",
            ByteSize::b(moved),
            elapsed,
            ByteSize::b(per_second as u64)
        ),
    );
    Ok(faults)
}
