//! GPU/VRAM backend.
//!
//! The region's storage lives in a VRAM buffer. The moving-inversions and
//! stress phases run as WGSL compute kernels directly on that buffer. Every
//! other phase downloads VRAM into a host window, runs the host kernels
//! there on a thread pool and uploads the result.

use crate::cpu::dispatch;
use crate::error::DeviceError;
use crate::gpu::buffers::{wait_for_queue, KernelBuffers, KernelParams, VramBuffer};
use crate::gpu::device::GpuInfo;
use crate::gpu::shaders::{KernelPipelines, WORKGROUP_SIZE};
use crate::ledger::ErrorLedger;
use crate::region::DeviceRegion;
use crate::traits::{LaunchShape, MemoryBackend, NativeGrid, NativeKernel};
use pollster::block_on;
use std::time::Duration;
use wgpu::{Adapter, Device, Queue};

const MB: u64 = 1024 * 1024;

/// VRAM memory backend.
pub struct GpuBackend {
    device: Device,
    queue: Queue,
    info: GpuInfo,
    pipelines: KernelPipelines,
    kernel_buffers: KernelBuffers,
    timeout: Duration,
    threads: usize,
    vram: Option<VramBuffer>,
}

impl GpuBackend {
    /// Opens a device on `adapter` and compiles the native kernels.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::DeviceRequest` if device creation fails and
    /// `DeviceError::ShaderCompilation` if a kernel does not validate.
    pub fn new(
        adapter: Adapter,
        info: GpuInfo,
        timeout_secs: u64,
        threads: Option<usize>,
    ) -> Result<Self, DeviceError> {
        let (device, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("vramscan"),
            required_features: wgpu::Features::empty(),
            // Ask for the adapter's own limits so buffer sizes are not capped at the defaults.
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| DeviceError::DeviceRequest(e.to_string()))?;
        log::debug!("opened device on {}", info);

        let pipelines = KernelPipelines::new(&device)?;
        let kernel_buffers = KernelBuffers::new(&device);

        Ok(Self {
            device,
            queue,
            info,
            pipelines,
            kernel_buffers,
            timeout: Duration::from_secs(timeout_secs),
            threads: threads.unwrap_or_else(num_cpus::get).max(1),
            vram: None,
        })
    }

    fn vram(&self) -> Result<&VramBuffer, DeviceError> {
        self.vram
            .as_ref()
            .ok_or_else(|| DeviceError::BufferMapping("no VRAM region allocated".to_string()))
    }

    /// Uniforms and workgroup count for `kernel` over `grid`.
    ///
    /// `params.base` is left at the first unit; [`Self::dispatch`] advances
    /// it per split dispatch. Returns the units covered by one workgroup.
    fn plan(kernel: NativeKernel, grid: NativeGrid) -> Result<(KernelParams, u32, u32), DeviceError> {
        let mut params = match kernel {
            NativeKernel::MoveInvWrite { pattern } | NativeKernel::MoveInvRead { pattern } => {
                KernelParams::with_patterns(pattern as u64, 0)
            }
            NativeKernel::MoveInvReadWrite { p1, p2 } => {
                KernelParams::with_patterns(p1 as u64, p2 as u64)
            }
            NativeKernel::StressWrite { pattern } => KernelParams::with_patterns(pattern, 0),
            NativeKernel::StressReadWrite { p1, p2 } => KernelParams::with_patterns(p1, p2),
        };
        match grid {
            NativeGrid::Blocks {
                layout,
                first,
                count,
            } if !kernel.is_stress() => {
                let end = (first + count).min(layout.total_blocks());
                params.base = to_u32(first, "first block")?;
                params.limit = to_u32(end, "block count")?;
                params.span = to_u32(layout.words_per_block(), "block size")?;
                Ok((params, params.limit.saturating_sub(params.base), 1))
            }
            NativeGrid::Chunks(chunks) if kernel.is_stress() => {
                let workers = to_u32(chunks.groups() * chunks.group_size(), "stress workers")?;
                params.limit = workers;
                params.span = to_u32(chunks.chunk_words(), "stress chunk")?;
                params.group_size = to_u32(chunks.group_size(), "stress group size")?;
                Ok((params, workers.div_ceil(WORKGROUP_SIZE), WORKGROUP_SIZE))
            }
            _ => Err(DeviceError::LaunchFailed(format!(
                "{:?} cannot run over {:?}",
                kernel, grid
            ))),
        }
    }

    /// Submits `workgroups` workgroups of `kernel`, split to respect the
    /// per-dimension dispatch limit.
    fn dispatch(
        &self,
        kernel: NativeKernel,
        mut params: KernelParams,
        workgroups: u32,
        units_per_workgroup: u32,
    ) -> Result<(), DeviceError> {
        let vram = self.vram()?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: self.pipelines.bind_group_layout(),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.kernel_buffers.params().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: vram.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.kernel_buffers.ledger().as_entire_binding(),
                },
            ],
        });

        let max_per_dispatch = self.device.limits().max_compute_workgroups_per_dimension.max(1);
        let first = params.base;
        let mut done = 0u32;
        while done < workgroups {
            let count = (workgroups - done).min(max_per_dispatch);
            params.base = first + done * units_per_workgroup;
            self.kernel_buffers.write_params(&self.queue, &params);

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("kernel_encoder"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("kernel_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(self.pipelines.pipeline(kernel));
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(count, 1, 1);
            }
            self.queue.submit(Some(encoder.finish()));
            done += count;
        }
        Ok(())
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32, DeviceError> {
    u32::try_from(value)
        .map_err(|_| DeviceError::LaunchFailed(format!("{} {} exceeds kernel range", what, value)))
}

impl MemoryBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "GPU/VRAM"
    }

    fn device_info(&self) -> String {
        format!("{} {} ({:?})", self.info.vendor, self.info.name, self.info.backend)
    }

    fn max_testable_memory(&self) -> u64 {
        let limits = self.device.limits();
        // Native kernels bind the whole region as one storage buffer.
        limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64)
    }

    fn allocate(&mut self, bytes: usize) -> Result<DeviceRegion, DeviceError> {
        let available = self.max_testable_memory();
        if bytes as u64 > available {
            return Err(DeviceError::InsufficientVram {
                needed_mb: bytes as u64 / MB,
                available_mb: available / MB,
            });
        }
        // Offset addressing: fault addresses are byte offsets into the buffer.
        let region = DeviceRegion::allocate(bytes, Some(0))?;
        self.vram = Some(VramBuffer::new(&self.device, bytes as u64));
        log::debug!("allocated {:?} in VRAM", region);
        Ok(region)
    }

    fn release(&mut self, region: DeviceRegion) {
        if let Some(vram) = self.vram.take() {
            log::debug!("released {} bytes of VRAM", vram.size());
        }
        drop(region);
    }

    fn upload(&self, region: &DeviceRegion, offset: usize, data: &[u32]) -> Result<(), DeviceError> {
        region.copy_from_host(offset, data)?;
        self.vram()?.write_words(&self.queue, offset, data);
        self.queue.submit(std::iter::empty());
        wait_for_queue(&self.device, &self.queue, self.timeout)
    }

    fn begin_phase(&self, region: &DeviceRegion) -> Result<(), DeviceError> {
        self.vram()?
            .download_region(&self.device, &self.queue, region, self.timeout)
    }

    fn end_phase(&self, region: &DeviceRegion) -> Result<(), DeviceError> {
        self.vram()?
            .upload_region(&self.device, &self.queue, region, self.timeout)
    }

    fn launch(
        &self,
        _region: &DeviceRegion,
        shape: LaunchShape,
        kernel: &(dyn Fn(usize) + Sync),
    ) -> Result<(), DeviceError> {
        dispatch(self.threads, shape, kernel)
    }

    fn supports_native(&self, _kernel: NativeKernel) -> bool {
        true
    }

    fn launch_native(
        &self,
        _region: &DeviceRegion,
        ledger: &ErrorLedger,
        kernel: NativeKernel,
        grid: NativeGrid,
    ) -> Result<(), DeviceError> {
        let (params, workgroups, units_per_workgroup) = Self::plan(kernel, grid)?;
        self.kernel_buffers.reset_ledger(&self.queue);
        self.dispatch(kernel, params, workgroups, units_per_workgroup)?;

        let (total, records) =
            self.kernel_buffers
                .read_ledger(&self.device, &self.queue, self.timeout)?;
        if total > 0 {
            log::debug!("{:?}: {} fault(s) on device", kernel, total);
        }
        ledger.absorb(total, &records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{MemTest, TestContext};
    use crate::region::{BlockLayout, ChunkLayout, MIN_BLOCK_SIZE};
    use crate::report::CaptureReporter;
    use crate::stats::TestStats;
    use crate::traits::TestConfig;
    use std::sync::atomic::AtomicBool;

    fn setup_backend() -> Option<GpuBackend> {
        let (adapter, info) = crate::gpu::device::select_gpu(None).ok()?;
        GpuBackend::new(adapter, info, 30, Some(2)).ok()
    }

    #[test]
    fn test_gpu_backend_name() {
        let Some(backend) = setup_backend() else {
            println!("No GPU available, skipping backend test");
            return;
        };
        assert_eq!(backend.name(), "GPU/VRAM");
        assert!(backend.device_info().contains(&backend.info.name));
        assert!(backend.max_testable_memory() > 0);
    }

    #[test]
    fn test_insufficient_vram() {
        let Some(mut backend) = setup_backend() else {
            println!("No GPU available, skipping capacity test");
            return;
        };
        let too_big = backend.max_testable_memory().saturating_add(4096);
        let Ok(too_big) = usize::try_from(too_big) else {
            return;
        };
        let result = backend.allocate(too_big);
        assert!(matches!(result, Err(DeviceError::InsufficientVram { .. })));
    }

    #[test]
    fn test_phase_round_trip_through_vram() {
        let Some(mut backend) = setup_backend() else {
            println!("No GPU available, skipping phase round trip");
            return;
        };
        let region = backend.allocate(16 * 1024).unwrap();
        assert_eq!(region.base(), 0);

        backend.begin_phase(&region).unwrap();
        region.fill(0x5A5A_5A5A);
        backend.end_phase(&region).unwrap();

        region.fill(0);
        backend.begin_phase(&region).unwrap();
        assert_eq!(region.load(0), 0x5A5A_5A5A);
        assert_eq!(region.load(region.len_words() - 1), 0x5A5A_5A5A);

        backend.upload(&region, 3, &[7, 8]).unwrap();
        region.fill(0);
        backend.begin_phase(&region).unwrap();
        assert_eq!(region.copy_to_host(2, 3).unwrap(), vec![0x5A5A_5A5A, 7, 8]);

        backend.release(region);
        assert!(backend.begin_phase(&DeviceRegion::allocate(4096, Some(0)).unwrap()).is_err());
    }

    #[test]
    fn test_native_move_inv_detects_corruption() {
        let Some(mut backend) = setup_backend() else {
            println!("No GPU available, skipping native kernel test");
            return;
        };
        let layout = BlockLayout::new(MIN_BLOCK_SIZE, 8);
        let region = backend.allocate(layout.region_bytes()).unwrap();
        let ledger = ErrorLedger::default();
        let all = NativeGrid::Blocks {
            layout,
            first: 0,
            count: 8,
        };

        backend
            .launch_native(&region, &ledger, NativeKernel::MoveInvWrite { pattern: 0 }, all)
            .unwrap();
        let target = layout.block(3).unwrap().start_word + 5;
        backend.upload(&region, target, &[0x0000_0100]).unwrap();
        backend
            .launch_native(
                &region,
                &ledger,
                NativeKernel::MoveInvReadWrite { p1: 0, p2: u32::MAX },
                all,
            )
            .unwrap();

        let readout = ledger.read_and_reset();
        assert_eq!(readout.total, 1);
        assert_eq!(readout.records[0].address, (target * 4) as u64);
        assert_eq!(readout.records[0].expected, 0);
        assert_eq!(readout.records[0].observed, 0x100);

        backend
            .launch_native(&region, &ledger, NativeKernel::MoveInvRead { pattern: u32::MAX }, all)
            .unwrap();
        assert!(ledger.read_and_reset().is_clean());

        backend.begin_phase(&region).unwrap();
        assert_eq!(region.load(target), u32::MAX);
        backend.release(region);
    }

    #[test]
    fn test_native_stress_lanes() {
        let Some(mut backend) = setup_backend() else {
            println!("No GPU available, skipping native stress test");
            return;
        };
        let region = backend.allocate(64 * 1024).unwrap();
        let chunks = ChunkLayout::new(region.len_bytes(), 4, 8);
        let ledger = ErrorLedger::default();
        let p1 = 0x0123_4567_89AB_CDEF;

        backend
            .launch_native(&region, &ledger, NativeKernel::StressWrite { pattern: p1 }, NativeGrid::Chunks(chunks))
            .unwrap();
        backend.upload(&region, 2 * 1024 + 1, &[0]).unwrap();
        backend
            .launch_native(
                &region,
                &ledger,
                NativeKernel::StressReadWrite { p1, p2: !p1 },
                NativeGrid::Chunks(chunks),
            )
            .unwrap();

        let readout = ledger.read_and_reset();
        assert_eq!(readout.total, 1);
        assert_eq!(readout.records[0].address, 1024 * 8);
        assert_eq!(readout.records[0].observed, 0x0000_0000_89AB_CDEF);

        backend.begin_phase(&region).unwrap();
        assert_eq!(region.load_wide(0), !p1);
        backend.release(region);
    }

    #[test]
    fn test_native_grid_mismatch_rejected() {
        let grid = NativeGrid::Chunks(ChunkLayout::new(4096, 1, 1));
        assert!(GpuBackend::plan(NativeKernel::MoveInvRead { pattern: 0 }, grid).is_err());

        let layout = BlockLayout::new(MIN_BLOCK_SIZE, 4);
        let (params, workgroups, per) = GpuBackend::plan(
            NativeKernel::MoveInvWrite { pattern: 7 },
            NativeGrid::Blocks {
                layout,
                first: 2,
                count: 512,
            },
        )
        .unwrap();
        assert_eq!((params.base, params.limit, params.p1_lo), (2, 4, 7));
        assert_eq!(params.span, 1024);
        assert_eq!((workgroups, per), (2, 1));
    }

    #[test]
    fn test_moving_inversions_on_vram() {
        let Some(mut backend) = setup_backend() else {
            println!("No GPU available, skipping VRAM scan");
            return;
        };
        let config = TestConfig {
            block_size: MIN_BLOCK_SIZE,
            ..Default::default()
        };
        let layout = BlockLayout::new(MIN_BLOCK_SIZE, 8);
        let region = backend.allocate(layout.region_bytes()).unwrap();
        let ledger = ErrorLedger::default();
        let reporter = CaptureReporter::default();
        let stats = TestStats::new();
        let stop = AtomicBool::new(false);
        let ctx = TestContext {
            backend: &backend,
            region: &region,
            layout,
            ledger: &ledger,
            config: &config,
            reporter: &reporter,
            stats: &stats,
            should_stop: &stop,
        };
        assert_eq!(MemTest::Test2.run(&ctx).unwrap(), 0);
        drop(ctx);
        backend.release(region);
    }
}
