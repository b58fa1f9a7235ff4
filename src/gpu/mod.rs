//! GPU/VRAM backend built on wgpu (Vulkan, Metal, DX12).
//!
//! The region is stored in a VRAM buffer. Moving-inversions and stress
//! phases run as WGSL compute kernels on it; the other phases are staged
//! through host memory.

pub mod backend;
pub mod buffers;
pub mod device;
pub mod shaders;

pub use backend::GpuBackend;
pub use device::{enumerate_gpus, select_gpu};
