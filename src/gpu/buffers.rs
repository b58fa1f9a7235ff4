//! VRAM storage buffer and the staging path to and from the host window.
//!
//! Transfers are split into chunks of at most [`STAGING_CHUNK_BYTES`], so a
//! multi-gigabyte region never needs a second full-size buffer.

use crate::error::DeviceError;
use crate::ledger::FaultRecord;
use crate::region::{DeviceRegion, WORD_BYTES};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};
use wgpu::{Buffer, BufferUsages, Device, Queue};

/// Largest single transfer between VRAM and the host window.
pub const STAGING_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Record slots of the device-side ledger.
/// Must match `LEDGER_SLOTS` in the WGSL kernels.
pub const LEDGER_SLOTS: usize = 10;

/// Bytes of the device-side ledger: an atomic count followed by the slots.
pub const LEDGER_BYTES: u64 =
    (WORD_BYTES + LEDGER_SLOTS * std::mem::size_of::<DeviceFault>()) as u64;

/// Kernel uniforms. Must match the Params struct in the WGSL kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub p1_lo: u32,
    pub p1_hi: u32,
    pub p2_lo: u32,
    pub p2_hi: u32,
    /// First block (moving inversions) or first worker (stress) of the dispatch.
    pub base: u32,
    /// One past the last block, or the total worker count.
    pub limit: u32,
    /// 32-bit words per block, or 64-bit words per stress chunk.
    pub span: u32,
    /// Stress lanes per group.
    pub group_size: u32,
}

impl KernelParams {
    pub fn with_patterns(p1: u64, p2: u64) -> Self {
        Self {
            p1_lo: p1 as u32,
            p1_hi: (p1 >> 32) as u32,
            p2_lo: p2 as u32,
            p2_hi: (p2 >> 32) as u32,
            ..Default::default()
        }
    }
}

/// One slot of the device-side ledger, as 32-bit halves.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DeviceFault {
    pub address_lo: u32,
    pub address_hi: u32,
    pub expected_lo: u32,
    pub expected_hi: u32,
    pub observed_lo: u32,
    pub observed_hi: u32,
    pub reread_lo: u32,
    pub reread_hi: u32,
}

impl DeviceFault {
    pub fn to_record(self) -> FaultRecord {
        let join = |lo: u32, hi: u32| ((hi as u64) << 32) | lo as u64;
        FaultRecord {
            address: join(self.address_lo, self.address_hi),
            expected: join(self.expected_lo, self.expected_hi),
            observed: join(self.observed_lo, self.observed_hi),
            reread: join(self.reread_lo, self.reread_hi),
        }
    }
}

/// Decodes a ledger readback into the exact fault count and surviving records.
pub fn decode_ledger(bytes: &[u8]) -> (u64, Vec<FaultRecord>) {
    let Some(count) = bytes.get(..WORD_BYTES) else {
        return (0, Vec::new());
    };
    let total = bytemuck::pod_read_unaligned::<u32>(count) as u64;
    let live = (total as usize).min(LEDGER_SLOTS);
    let records = bytes[WORD_BYTES..]
        .chunks_exact(std::mem::size_of::<DeviceFault>())
        .take(live)
        .map(|slot| bytemuck::pod_read_unaligned::<DeviceFault>(slot).to_record())
        .collect();
    (total, records)
}

/// Uniform and ledger buffers shared by every native kernel launch.
pub struct KernelBuffers {
    params: Buffer,
    ledger: Buffer,
    ledger_staging: Buffer,
}

impl KernelBuffers {
    pub fn new(device: &Device) -> Self {
        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel_params"),
            size: std::mem::size_of::<KernelParams>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ledger = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fault_ledger"),
            size: LEDGER_BYTES,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let ledger_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fault_ledger_staging"),
            size: LEDGER_BYTES,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            params,
            ledger,
            ledger_staging,
        }
    }

    pub fn params(&self) -> &Buffer {
        &self.params
    }

    pub fn ledger(&self) -> &Buffer {
        &self.ledger
    }

    pub fn write_params(&self, queue: &Queue, params: &KernelParams) {
        queue.write_buffer(&self.params, 0, bytemuck::bytes_of(params));
    }

    pub fn reset_ledger(&self, queue: &Queue) {
        queue.write_buffer(&self.ledger, 0, &[0u8; LEDGER_BYTES as usize]);
    }

    /// Copies the ledger out of VRAM, waits for it and decodes it.
    pub fn read_ledger(
        &self,
        device: &Device,
        queue: &Queue,
        timeout: Duration,
    ) -> Result<(u64, Vec<FaultRecord>), DeviceError> {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("ledger_readback"),
        });
        encoder.copy_buffer_to_buffer(&self.ledger, 0, &self.ledger_staging, 0, LEDGER_BYTES);
        queue.submit(Some(encoder.finish()));

        let slice = self.ledger_staging.slice(..);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        poll_until(device, &rx, timeout)?.map_err(|e| DeviceError::BufferMapping(e.to_string()))?;

        let data = slice.get_mapped_range();
        let decoded = decode_ledger(&data);
        drop(data);
        self.ledger_staging.unmap();
        Ok(decoded)
    }
}

/// The region's backing storage in VRAM plus a reusable readback buffer.
pub struct VramBuffer {
    buffer: Buffer,
    staging: Buffer,
    size: u64,
}

impl VramBuffer {
    /// Allocates `size` bytes of VRAM (zero-initialized by wgpu).
    pub fn new(device: &Device, size: u64) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vram_region"),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vram_staging"),
            size: size.min(STAGING_CHUNK_BYTES),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            staging,
            size,
        }
    }

    /// Size of the VRAM buffer in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The storage buffer native kernels bind as `data`.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// `(byte_offset, byte_len)` of each staging chunk.
    fn chunks(&self) -> impl Iterator<Item = (u64, u64)> {
        let size = self.size;
        (0..size)
            .step_by(STAGING_CHUNK_BYTES as usize)
            .map(move |offset| (offset, (size - offset).min(STAGING_CHUNK_BYTES)))
    }

    /// Queues a write of host words at `word_offset`.
    pub fn write_words(&self, queue: &Queue, word_offset: usize, words: &[u32]) {
        queue.write_buffer(
            &self.buffer,
            (word_offset * WORD_BYTES) as u64,
            bytemuck::cast_slice(words),
        );
    }

    /// Copies the host window into VRAM and waits for the copies to land.
    pub fn upload_region(
        &self,
        device: &Device,
        queue: &Queue,
        region: &DeviceRegion,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        for (offset, len) in self.chunks() {
            let word_offset = offset as usize / WORD_BYTES;
            let words = region.copy_to_host(word_offset, len as usize / WORD_BYTES)?;
            self.write_words(queue, word_offset, &words);
            queue.submit(std::iter::empty());
            wait_for_queue(device, queue, timeout)?;
        }
        Ok(())
    }

    /// Reads VRAM back into the host window through the staging buffer.
    pub fn download_region(
        &self,
        device: &Device,
        queue: &Queue,
        region: &DeviceRegion,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        for (offset, len) in self.chunks() {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vram_readback"),
            });
            encoder.copy_buffer_to_buffer(&self.buffer, offset, &self.staging, 0, len);
            queue.submit(Some(encoder.finish()));

            let slice = self.staging.slice(..len);
            let (tx, rx) = channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                tx.send(result).ok();
            });
            poll_until(device, &rx, timeout)?
                .map_err(|e| DeviceError::BufferMapping(e.to_string()))?;

            let data = slice.get_mapped_range();
            let words: Vec<u32> = data
                .chunks_exact(WORD_BYTES)
                .map(bytemuck::pod_read_unaligned::<u32>)
                .collect();
            drop(data);
            self.staging.unmap();

            region.copy_from_host(offset as usize / WORD_BYTES, &words)?;
        }
        Ok(())
    }
}

/// Blocks until all submitted queue work has completed.
pub fn wait_for_queue(device: &Device, queue: &Queue, timeout: Duration) -> Result<(), DeviceError> {
    let (tx, rx) = channel();
    queue.on_submitted_work_done(move || {
        tx.send(()).ok();
    });
    poll_until(device, &rx, timeout)
}

/// Polls the device until `rx` yields a value or `timeout` elapses.
fn poll_until<T>(device: &Device, rx: &Receiver<T>, timeout: Duration) -> Result<T, DeviceError> {
    let start = Instant::now();
    loop {
        let _ = device.poll(wgpu::PollType::Poll);

        if let Ok(value) = rx.try_recv() {
            return Ok(value);
        }

        if start.elapsed() > timeout {
            return Err(DeviceError::Timeout(timeout.as_secs()));
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::select_gpu;
    use pollster::block_on;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn setup_device() -> Option<(Device, Queue)> {
        let (adapter, _) = select_gpu(None).ok()?;
        block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("test device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .ok()
    }

    #[test]
    fn test_kernel_params_layout() {
        // Uniform blocks are 16-byte aligned.
        assert_eq!(std::mem::size_of::<KernelParams>(), 32);
        let params = KernelParams::with_patterns(0x1122_3344_5566_7788, 0xFFFF_0000_0000_FFFF);
        assert_eq!(params.p1_lo, 0x5566_7788);
        assert_eq!(params.p1_hi, 0x1122_3344);
        assert_eq!(params.p2_lo, 0x0000_FFFF);
        assert_eq!(params.p2_hi, 0xFFFF_0000);
    }

    #[test]
    fn test_ledger_layout() {
        assert_eq!(std::mem::size_of::<DeviceFault>(), 32);
        assert_eq!(LEDGER_BYTES, 4 + 10 * 32);
        assert_eq!(LEDGER_BYTES % wgpu::COPY_BUFFER_ALIGNMENT, 0);
        assert_eq!(LEDGER_SLOTS, crate::ledger::MAX_ERR_RECORD_COUNT);
    }

    #[test]
    fn test_decode_ledger() {
        let mut bytes = vec![0u8; LEDGER_BYTES as usize];
        bytes[..4].copy_from_slice(&13u32.to_le_bytes());
        let fault = DeviceFault {
            address_lo: 0x40,
            address_hi: 1,
            expected_lo: 0xFFFF_FFFF,
            observed_lo: 0xFFFF_FFFE,
            reread_lo: 0xFFFF_FFFF,
            ..Default::default()
        };
        bytes[4..36].copy_from_slice(bytemuck::bytes_of(&fault));

        let (total, records) = decode_ledger(&bytes);
        assert_eq!(total, 13);
        assert_eq!(records.len(), LEDGER_SLOTS);
        assert_eq!(records[0].address, 0x1_0000_0040);
        assert_eq!(records[0].diff(), 1);
        assert_eq!(records[1], FaultRecord::default());

        bytes[..4].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(decode_ledger(&bytes).1.len(), 1);
        assert_eq!(decode_ledger(&[]), (0, Vec::new()));
    }

    #[test]
    fn test_staging_chunks_cover_buffer() {
        let Some((device, _queue)) = setup_device() else {
            println!("No GPU available, skipping chunk test");
            return;
        };
        let vram = VramBuffer::new(&device, 64 * 1024);
        let chunks: Vec<(u64, u64)> = vram.chunks().collect();
        assert_eq!(chunks, vec![(0, 64 * 1024)]);
        assert_eq!(vram.size(), 64 * 1024);
    }

    #[test]
    fn test_vram_round_trip() {
        let Some((device, queue)) = setup_device() else {
            println!("No GPU available, skipping VRAM round trip");
            return;
        };
        let region = DeviceRegion::allocate(64 * 1024, Some(0)).unwrap();
        let vram = VramBuffer::new(&device, region.len_bytes() as u64);

        for i in 0..region.len_words() {
            region.store(i, (i as u32).wrapping_mul(0x9E37_79B9));
        }
        vram.upload_region(&device, &queue, &region, TIMEOUT).unwrap();
        region.fill(0);
        vram.download_region(&device, &queue, &region, TIMEOUT).unwrap();

        assert_eq!(region.load(1), 0x9E37_79B9);
        assert_eq!(region.load(7), 7u32.wrapping_mul(0x9E37_79B9));
    }

    #[test]
    fn test_write_words_lands_in_vram() {
        let Some((device, queue)) = setup_device() else {
            println!("No GPU available, skipping write test");
            return;
        };
        let region = DeviceRegion::allocate(4096, Some(0)).unwrap();
        let vram = VramBuffer::new(&device, 4096);
        vram.write_words(&queue, 10, &[0xAAAA_5555, 0x5555_AAAA]);
        queue.submit(std::iter::empty());
        wait_for_queue(&device, &queue, TIMEOUT).unwrap();

        vram.download_region(&device, &queue, &region, TIMEOUT).unwrap();
        assert_eq!(region.copy_to_host(9, 3).unwrap(), vec![0, 0xAAAA_5555, 0x5555_AAAA]);
    }
}
