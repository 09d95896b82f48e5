//! GPU memory management using gpu-allocator.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use log::{debug, warn};
use parking_lot::Mutex;

use super::VulkanContext;
use crate::error::ContextError;

/// Buffers and the allocations backing them.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
    buffers: HashMap<vk::Buffer, Allocation>,
}

impl MemoryManager {
    pub fn new(ctx: &VulkanContext) -> Result<Self, ContextError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings: debug_settings(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
            buffers: HashMap::new(),
        })
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<vk::Buffer, vk::Result> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!("failed to allocate {} bytes for {}: {}", size, name, e);
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        };

        if let Err(e) = unsafe { self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) } {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(handle, None) };
            return Err(e);
        }

        debug!("allocated {} ({} bytes, {:?})", name, size, location);
        self.buffers.insert(handle, allocation);
        Ok(handle)
    }

    /// Copy `data` into the persistently mapped memory of `buffer`.
    pub fn write(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> Result<(), vk::Result> {
        let mapped = self
            .buffers
            .get_mut(&buffer)
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;

        let start = offset as usize;
        let end = start + data.len();
        let target = mapped.get_mut(start..end).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Destroy a buffer and free its memory.
    pub fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        if let Some(allocation) = self.buffers.remove(&buffer) {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
        }
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            warn!("failed to free allocation: {}", e);
        }
    }
}

/// Leak reports always, memory dumps in debug builds only.
fn debug_settings() -> AllocatorDebugSettings {
    let mut settings = AllocatorDebugSettings::default();
    settings.log_memory_information = cfg!(debug_assertions);
    settings.log_leaks_on_shutdown = true;
    settings
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            warn!("{} buffers still alive at teardown", self.buffers.len());
        }
        let buffers: Vec<vk::Buffer> = self.buffers.keys().copied().collect();
        for buffer in buffers {
            self.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_settings_report_leaks() {
        let settings = debug_settings();
        assert!(settings.log_leaks_on_shutdown);
        assert_eq!(settings.log_memory_information, cfg!(debug_assertions));
    }
}
