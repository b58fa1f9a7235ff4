mod algorithms;
mod cpu;
mod driver;
mod error;
#[cfg(feature = "gpu")]
mod gpu;
mod kernels;
mod ledger;
mod patterns;
mod region;
mod report;
mod stats;
mod traits;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use clap::Parser;
use cpu::CpuBackend;
use driver::{RunSummary, TestDriver, TestRegistry};
use error::{VramscanError, EXIT_BAD_STATE};
use report::{ConsoleReporter, Verbosity};
use stats::TestStats;
use traits::{MemoryBackend, TestConfig};

const DEFAULT_MAX_BLOCKS: usize = 1024; // 1 GB of 1 MiB blocks

/// Index of the bandwidth stress test selected by `--stress`.
const STRESS_TEST_INDEX: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about = "Block-partitioned GPU/host memory diagnostic", long_about = None)]
struct Args {
    /// Maximum number of 1 MiB blocks to scan
    #[arg(short, long, default_value_t = DEFAULT_MAX_BLOCKS)]
    max_blocks: usize,

    /// Passes over the enabled tests
    #[arg(long, default_value_t = 1)]
    num_passes: u32,

    /// Internal iterations of tests 0 and 10
    #[arg(long, default_value_t = 1)]
    num_iterations: u32,

    /// Disable every test before applying --enable-test
    #[arg(long, default_value_t = false)]
    disable_all: bool,

    /// Enable a test by index (repeatable)
    #[arg(long, value_name = "INDEX")]
    enable_test: Vec<usize>,

    /// Disable a test by index (repeatable)
    #[arg(long, value_name = "INDEX")]
    disable_test: Vec<usize>,

    /// Stop at the first phase that reads back faults
    #[arg(long, default_value_t = false)]
    exit_on_error: bool,

    /// Hex pattern for tests 4 and 8 (low 32 bits) and 10
    #[arg(long, value_parser = parse_hex)]
    pattern: Option<u64>,

    /// 0: start/end only, 1: +patterns, 2: +progress
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbose: u8,

    /// Redraw progress in place
    #[arg(long, default_value_t = false, conflicts_with = "silent")]
    interactive: bool,

    /// Print progress as plain lines (default)
    #[arg(long, default_value_t = false)]
    silent: bool,

    /// Run only the bandwidth stress test, exiting on the first fault
    #[arg(long, default_value_t = false)]
    stress: bool,

    /// List the tests and exit
    #[arg(long, default_value_t = false)]
    list_tests: bool,

    /// Dwell between bit-fade phases (e.g., '90m', '30s')
    #[arg(long, value_parser = parse_duration, default_value = "90m")]
    bit_fade_dwell: Duration,

    #[arg(short, long, help = "Number of threads (default: CPU count)")]
    threads: Option<usize>,

    /// Test GPU VRAM instead of CPU RAM
    #[arg(long, default_value_t = false)]
    gpu: bool,

    /// Select GPU by index (use --list-gpus to see available)
    #[arg(long, visible_alias = "device")]
    gpu_index: Option<usize>,

    /// List available GPUs and exit
    #[arg(long, default_value_t = false)]
    list_gpus: bool,

    /// Timeout per GPU transfer in seconds
    #[arg(long, default_value_t = 30)]
    gpu_timeout: u64,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex pattern '{}': {}", s, e))
}

fn build_config(args: &Args) -> TestConfig {
    TestConfig {
        max_blocks: args.max_blocks,
        num_passes: args.num_passes,
        num_iterations: args.num_iterations,
        exit_on_error: args.exit_on_error || args.stress,
        pattern: args.pattern,
        verbosity: Verbosity::from_level(args.verbose),
        interactive: args.interactive && !args.silent,
        bit_fade_dwell: args.bit_fade_dwell,
        ..Default::default()
    }
}

fn build_registry(args: &Args) -> Result<TestRegistry, VramscanError> {
    let mut registry = TestRegistry::new();
    let mut enables = args.enable_test.clone();
    if args.stress {
        enables.push(STRESS_TEST_INDEX);
    }
    registry.apply(args.disable_all || args.stress, &enables, &args.disable_test)?;
    Ok(registry)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if args.list_tests {
        println!("Available tests:");
        for descriptor in TestRegistry::new().descriptors() {
            println!(
                "  {:>2}: {}{}",
                descriptor.test.index(),
                descriptor.name(),
                if descriptor.enabled { "" } else { " (disabled by default)" }
            );
        }
        std::process::exit(0);
    }

    // Handle --list-gpus early
    if args.list_gpus {
        #[cfg(feature = "gpu")]
        {
            let gpus = gpu::enumerate_gpus();
            if gpus.is_empty() {
                println!("No GPUs found.");
            } else {
                println!("Available GPUs:");
                for gpu_info in &gpus {
                    println!("  {}", gpu_info);
                }
                println!();
                println!("Use --gpu to test VRAM, --gpu-index N to select specific GPU");
            }
        }
        #[cfg(not(feature = "gpu"))]
        {
            println!("GPU support not compiled. Build with: cargo build --features gpu");
        }
        std::process::exit(0);
    }

    // Warn if --gpu-index used without --gpu
    if args.gpu_index.is_some() && !args.gpu {
        eprintln!("Warning: --gpu-index has no effect without --gpu flag");
    }

    let result = run(&args);
    match &result {
        Ok(summary) if summary.has_faults() => {
            println!();
            println!("MEMORY FAULTS DETECTED!");
        }
        Ok(_) => {
            println!();
            println!("SUCCESS: No memory faults detected!");
        }
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
        }
    }
    std::process::exit(exit_code_for(&result));
}

fn run(args: &Args) -> Result<RunSummary, VramscanError> {
    let config = build_config(args);
    let registry = build_registry(args)?;
    let backend = if args.gpu {
        gpu_backend(args)?
    } else {
        Box::new(CpuBackend::new(args.threads)) as Box<dyn MemoryBackend>
    };
    let reporter = Box::new(ConsoleReporter::new(config.verbosity, config.interactive));

    // Print header
    println!("Memory Diagnostic");
    println!("=================");
    println!("Device: {} ({})", backend.name(), backend.device_info());
    println!(
        "Region: up to {} blocks of {}",
        config.max_blocks,
        ByteSize::b(config.block_size as u64)
    );
    println!(
        "Tests: {:?}",
        registry
            .enabled()
            .iter()
            .map(|t| t.index())
            .collect::<Vec<_>>()
    );
    println!("Passes: {}", config.num_passes);
    println!();

    let stats = Arc::new(TestStats::new());
    let should_stop = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&should_stop));

    let start_time = Instant::now();
    let mut driver = TestDriver::new(backend, config, registry, reporter);
    let result = driver.run(Arc::clone(&stats), should_stop);
    print_stats(&stats, start_time.elapsed());
    if let Ok(summary) = &result {
        println!(
            "Region: {} blocks ({}) in {}",
            summary.blocks,
            ByteSize::b(summary.region_bytes),
            humantime::format_duration(Duration::from_secs(summary.duration.as_secs()))
        );
        for r in summary.results.iter().filter(|r| r.faults > 0) {
            println!(
                "  pass {} {}: {} fault(s) in {} ms",
                r.pass,
                r.test.name(),
                r.faults,
                r.duration_ms
            );
        }
    }
    result
}

fn install_interrupt_handler(should_stop: Arc<AtomicBool>) {
    let handler = move || {
        eprintln!("Interrupt received, stopping at the next phase boundary");
        should_stop.store(true, Ordering::SeqCst);
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        log::warn!("could not install Ctrl-C handler: {}", e);
    }
}

fn print_stats(stats: &TestStats, elapsed: Duration) {
    println!();
    println!("Test Complete");
    println!("=============");
    println!("Total bytes tested: {}", ByteSize::b(stats.get_bytes()));
    println!("Total tests completed: {}", stats.get_tests());
    println!("Kernel phases: {}", stats.get_phases());
    println!("Faults found: {}", stats.get_faults());
    println!("Duration: {:.2}s", elapsed.as_secs_f64());
}

#[cfg(feature = "gpu")]
fn gpu_backend(args: &Args) -> Result<Box<dyn MemoryBackend>, VramscanError> {
    let (adapter, info) = gpu::select_gpu(args.gpu_index)?;
    println!("GPU: {}", info);
    let backend = gpu::GpuBackend::new(adapter, info, args.gpu_timeout, args.threads)?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "gpu"))]
fn gpu_backend(_args: &Args) -> Result<Box<dyn MemoryBackend>, VramscanError> {
    Err(VramscanError::Config(
        "GPU support not compiled. Build with: cargo build --features gpu".to_string(),
    ))
}

fn exit_code_for(result: &Result<RunSummary, VramscanError>) -> i32 {
    match result {
        Ok(summary) if summary.has_faults() => EXIT_BAD_STATE,
        Ok(_) => 0,
        Err(e) => e.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithms::MemTest;
    use error::EXIT_GENERAL;

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_duration_hours() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0xDEADBEEF").unwrap(), 0xDEAD_BEEF);
        assert_eq!(parse_hex("ff").unwrap(), 0xFF);
        assert_eq!(parse_hex("0X0123456789abcdef").unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(parse_hex("0xZZ").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["vramscan"]);
        assert_eq!(args.max_blocks, 1024);
        assert_eq!(args.num_passes, 1);
        assert_eq!(args.gpu_timeout, 30);
        assert_eq!(args.bit_fade_dwell, Duration::from_secs(90 * 60));

        let config = build_config(&args);
        assert!(!config.exit_on_error);
        assert!(!config.interactive);
        assert_eq!(config.verbosity, Verbosity::Quiet);
        assert_eq!(build_registry(&args).unwrap().enabled().len(), 10);
    }

    #[test]
    fn test_parse_gpu_index_and_alias() {
        let args = Args::parse_from(["vramscan", "--gpu", "--gpu-index", "1"]);
        assert!(args.gpu);
        assert_eq!(args.gpu_index, Some(1));

        let args = Args::parse_from(["vramscan", "--gpu", "--device", "2"]);
        assert_eq!(args.gpu_index, Some(2));
    }

    #[test]
    fn test_parse_list_flags() {
        assert!(Args::parse_from(["vramscan", "--list-gpus"]).list_gpus);
        assert!(Args::parse_from(["vramscan", "--list-tests"]).list_tests);
    }

    #[test]
    fn test_verbose_range() {
        let args = Args::parse_from(["vramscan", "--verbose", "2"]);
        assert_eq!(build_config(&args).verbosity, Verbosity::Progress);
        assert!(Args::try_parse_from(["vramscan", "--verbose", "3"]).is_err());
    }

    #[test]
    fn test_interactive_conflicts_with_silent() {
        assert!(Args::try_parse_from(["vramscan", "--interactive", "--silent"]).is_err());
        let args = Args::parse_from(["vramscan", "--interactive"]);
        assert!(build_config(&args).interactive);
    }

    #[test]
    fn test_enable_disable_overrides() {
        let args = Args::parse_from([
            "vramscan",
            "--disable-all",
            "--enable-test",
            "2",
            "--enable-test",
            "9",
            "--enable-test",
            "4",
            "--disable-test",
            "4",
        ]);
        let registry = build_registry(&args).unwrap();
        assert_eq!(registry.enabled(), vec![MemTest::Test2, MemTest::Test9]);
    }

    #[test]
    fn test_invalid_test_index() {
        let args = Args::parse_from(["vramscan", "--enable-test", "11"]);
        let err = build_registry(&args).unwrap_err();
        assert_eq!(err.exit_code(), EXIT_GENERAL);
    }

    #[test]
    fn test_stress_flag() {
        let args = Args::parse_from(["vramscan", "--stress", "--pattern", "0x5555AAAA5555AAAA"]);
        let config = build_config(&args);
        assert!(config.exit_on_error);
        assert_eq!(config.pattern, Some(0x5555_AAAA_5555_AAAA));
        assert_eq!(build_registry(&args).unwrap().enabled(), vec![MemTest::Test10]);
    }

    #[test]
    fn test_bit_fade_dwell_flag() {
        let args = Args::parse_from(["vramscan", "--bit-fade-dwell", "30s"]);
        assert_eq!(build_config(&args).bit_fade_dwell, Duration::from_secs(30));
    }

    #[test]
    fn test_exit_codes() {
        let faults = VramscanError::FaultsDetected {
            phase: "test2 read".to_string(),
            count: 1,
        };
        assert_eq!(exit_code_for(&Err(faults)), EXIT_BAD_STATE);
        let config = VramscanError::Config("bad".to_string());
        assert_eq!(exit_code_for(&Err(config)), EXIT_GENERAL);
    }
}
