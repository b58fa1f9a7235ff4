//! GPU device enumeration and selection.
//!
//! This module lists the available GPU adapters and picks one for VRAM
//! scanning, together with the buffer-size limit that caps the region.

use crate::error::DeviceError;
use bytesize::ByteSize;
use wgpu::{Adapter, Backend, Backends, DeviceType, Instance, InstanceDescriptor};

/// Information about an available GPU.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// Index in the enumerated list.
    pub index: usize,
    /// GPU name (e.g., "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Vendor name (e.g., "NVIDIA").
    pub vendor: String,
    /// Graphics API backend (Vulkan, Metal, DX12, etc.).
    pub backend: Backend,
    /// Device type (discrete, integrated, virtual, etc.).
    pub device_type: DeviceType,
    /// Driver version string.
    pub driver: String,
    /// Largest buffer the adapter can allocate, which bounds the region.
    pub max_buffer_size: u64,
}

impl GpuInfo {
    fn from_adapter(index: usize, adapter: &Adapter) -> Self {
        let info = adapter.get_info();
        Self {
            index,
            name: info.name,
            vendor: vendor_name(info.vendor),
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver,
            max_buffer_size: adapter.limits().max_buffer_size,
        }
    }
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} ({:?}, {:?}, max buffer {})",
            self.index,
            self.vendor,
            self.name,
            self.backend,
            self.device_type,
            ByteSize::b(self.max_buffer_size)
        )
    }
}

fn adapters() -> Vec<Adapter> {
    let instance = Instance::new(&InstanceDescriptor::default());
    instance.enumerate_adapters(Backends::all())
}

/// Enumerate all available GPU adapters.
///
/// The list may be empty if no GPUs are available.
pub fn enumerate_gpus() -> Vec<GpuInfo> {
    adapters()
        .iter()
        .enumerate()
        .map(|(index, adapter)| GpuInfo::from_adapter(index, adapter))
        .collect()
}

/// Select a GPU adapter by index, or the best available one when `index` is `None`.
///
/// # Errors
///
/// Returns `DeviceError::NoAdapter` if no GPUs are available.
/// Returns `DeviceError::AdapterNotFound` if the specified index is invalid.
pub fn select_gpu(index: Option<usize>) -> Result<(Adapter, GpuInfo), DeviceError> {
    let adapters = adapters();
    if adapters.is_empty() {
        return Err(DeviceError::NoAdapter);
    }

    let chosen = match index {
        Some(idx) if idx < adapters.len() => idx,
        Some(idx) => {
            return Err(DeviceError::AdapterNotFound {
                index: idx,
                available: adapters.iter().map(|a| a.get_info().name).collect(),
            });
        }
        None => {
            let types: Vec<DeviceType> = adapters.iter().map(|a| a.get_info().device_type).collect();
            auto_select(&types).unwrap_or(0)
        }
    };

    let adapter = adapters
        .into_iter()
        .nth(chosen)
        .ok_or(DeviceError::NoAdapter)?;
    let info = GpuInfo::from_adapter(chosen, &adapter);
    log::debug!("selected {}", info);
    Ok((adapter, info))
}

/// Preference order: discrete, integrated, virtual, software, anything else.
fn device_rank(device_type: DeviceType) -> u8 {
    match device_type {
        DeviceType::DiscreteGpu => 0,
        DeviceType::IntegratedGpu => 1,
        DeviceType::VirtualGpu => 2,
        DeviceType::Cpu => 3,
        DeviceType::Other => 4,
    }
}

/// Index of the best-ranked adapter; ties go to the lower index.
fn auto_select(types: &[DeviceType]) -> Option<usize> {
    types
        .iter()
        .enumerate()
        .min_by_key(|&(index, &device_type)| (device_rank(device_type), index))
        .map(|(index, _)| index)
}

/// Convert vendor ID to human-readable name.
fn vendor_name(vendor_id: u32) -> String {
    match vendor_id {
        0x1002 => "AMD".to_string(),
        0x1010 => "ImgTec".to_string(),
        0x10DE => "NVIDIA".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        _ => format!("Unknown (0x{:04X})", vendor_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> GpuInfo {
        GpuInfo {
            index: 0,
            name: "Test GPU".to_string(),
            vendor: "NVIDIA".to_string(),
            backend: Backend::Vulkan,
            device_type: DeviceType::DiscreteGpu,
            driver: "1.0".to_string(),
            max_buffer_size: 256 * 1024 * 1024,
        }
    }

    #[test]
    fn test_enumerate_gpus_returns_list() {
        // May be empty in CI without GPU.
        for (i, gpu) in enumerate_gpus().iter().enumerate() {
            assert_eq!(gpu.index, i);
            assert!(!gpu.name.is_empty());
            assert!(gpu.max_buffer_size > 0);
        }
    }

    #[test]
    fn test_gpu_info_display() {
        let display = format!("{}", sample_info());
        assert!(display.contains("Test GPU"));
        assert!(display.contains("Vulkan"));
        assert!(display.contains("[0]"));
        assert!(display.contains("max buffer"));
    }

    #[test]
    fn test_select_invalid_index() {
        match select_gpu(Some(999)) {
            Err(DeviceError::AdapterNotFound { index, .. }) => assert_eq!(index, 999),
            Err(DeviceError::NoAdapter) => {}
            other => panic!("expected AdapterNotFound or NoAdapter, got {:?}", other.map(|(_, i)| i)),
        }
    }

    #[test]
    fn test_select_returns_matching_info() {
        let Ok((adapter, info)) = select_gpu(None) else {
            println!("No GPU available, skipping selection test");
            return;
        };
        assert_eq!(adapter.get_info().name, info.name);
    }

    #[test]
    fn test_auto_select_ranking() {
        use DeviceType::*;
        assert_eq!(auto_select(&[]), None);
        assert_eq!(auto_select(&[Cpu, IntegratedGpu, DiscreteGpu]), Some(2));
        assert_eq!(auto_select(&[Other, VirtualGpu, IntegratedGpu]), Some(2));
        assert_eq!(auto_select(&[Other, Cpu]), Some(1));
        assert_eq!(auto_select(&[DiscreteGpu, DiscreteGpu]), Some(0));
    }

    #[test]
    fn test_vendor_names() {
        assert_eq!(vendor_name(0x10DE), "NVIDIA");
        assert_eq!(vendor_name(0x1002), "AMD");
        assert_eq!(vendor_name(0x8086), "Intel");
        assert_eq!(vendor_name(0x106B), "Apple");
        assert!(vendor_name(0x0000).contains("Unknown"));
    }
}
