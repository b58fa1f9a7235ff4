//! WGSL compute pipelines for the kernels that run natively in VRAM.
//!
//! The moving-inversions kernels (tests 2, 3, 4 and 9) and the bandwidth
//! stress kernels (test 10) share one bind group layout:
//! `params` uniform, `data` storage (the region) and `ledger` storage.

use crate::error::DeviceError;
use crate::traits::NativeKernel;
use pollster::block_on;
use wgpu::{BindGroupLayout, ComputePipeline, Device};

/// WGSL source of the moving-inversions kernels.
pub const MOVE_INV_WGSL: &str = include_str!("../shaders/move_inv.wgsl");

/// WGSL source of the stress kernels.
pub const STRESS_WGSL: &str = include_str!("../shaders/stress.wgsl");

/// Workgroup size used by compute shaders.
/// Must match the @workgroup_size in WGSL files.
pub const WORKGROUP_SIZE: u32 = 256;

/// Compiled pipelines for every native kernel.
pub struct KernelPipelines {
    layout: BindGroupLayout,
    move_inv_write: ComputePipeline,
    move_inv_readwrite: ComputePipeline,
    move_inv_read: ComputePipeline,
    stress_write: ComputePipeline,
    stress_readwrite: ComputePipeline,
}

impl KernelPipelines {
    /// Compiles both shader modules and builds one pipeline per entry point.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::ShaderCompilation` if validation fails.
    pub fn new(device: &Device) -> Result<Self, DeviceError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let move_inv = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("move_inv"),
            source: wgpu::ShaderSource::Wgsl(MOVE_INV_WGSL.into()),
        });
        let stress = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("stress"),
            source: wgpu::ShaderSource::Wgsl(STRESS_WGSL.into()),
        });

        // @group(0) @binding(0) - Uniform buffer (Params)
        // @group(0) @binding(1) - Storage buffer (data, read_write)
        // @group(0) @binding(2) - Storage buffer (ledger, read_write)
        let storage = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(1),
                storage(2),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = |module: &wgpu::ShaderModule, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module,
                entry_point: Some(entry),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };
        let pipelines = Self {
            move_inv_write: pipeline(&move_inv, "move_inv_write"),
            move_inv_readwrite: pipeline(&move_inv, "move_inv_readwrite"),
            move_inv_read: pipeline(&move_inv, "move_inv_read"),
            stress_write: pipeline(&stress, "stress_write"),
            stress_readwrite: pipeline(&stress, "stress_readwrite"),
            layout,
        };

        if let Some(error) = block_on(device.pop_error_scope()) {
            return Err(DeviceError::ShaderCompilation(error.to_string()));
        }
        Ok(pipelines)
    }

    pub fn bind_group_layout(&self) -> &BindGroupLayout {
        &self.layout
    }

    /// Pipeline that runs `kernel`.
    pub fn pipeline(&self, kernel: NativeKernel) -> &ComputePipeline {
        match kernel {
            NativeKernel::MoveInvWrite { .. } => &self.move_inv_write,
            NativeKernel::MoveInvReadWrite { .. } => &self.move_inv_readwrite,
            NativeKernel::MoveInvRead { .. } => &self.move_inv_read,
            NativeKernel::StressWrite { .. } => &self.stress_write,
            NativeKernel::StressReadWrite { .. } => &self.stress_readwrite,
        }
    }
}
