//! GPU buffer with its backing allocation.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::{GpuError, VkResultExt};
use crate::gpu::{BufferDesc, GpuDevice};

/// A single buffer allocation.
///
/// The allocation is owned by the device implementation and released by
/// [`GpuBuffer::destroy`].
#[derive(Debug)]
pub struct GpuBuffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    location: MemoryLocation,
}

impl GpuBuffer {
    /// Create a buffer with the specified usage and memory location.
    pub fn create<D: GpuDevice>(
        device: &mut D,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self, GpuError> {
        let handle = device
            .create_buffer(&BufferDesc { size, usage, location, name })
            .op("create buffer")?;

        Ok(Self { handle, size, location })
    }

    /// Create a staging buffer (CPU-visible, transfer source).
    pub fn staging<D: GpuDevice>(device: &mut D, size: vk::DeviceSize, name: &str) -> Result<Self, GpuError> {
        Self::create(device, size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu, name)
    }

    /// Create a vertex buffer (GPU-only, filled by transfers).
    pub fn vertex<D: GpuDevice>(device: &mut D, size: vk::DeviceSize, name: &str) -> Result<Self, GpuError> {
        Self::create(
            device,
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_host_visible(&self) -> bool {
        matches!(self.location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu)
    }

    /// Write `data` at `offset` through a host mapping of the range.
    pub fn write<D: GpuDevice>(&self, device: &mut D, offset: vk::DeviceSize, data: &[u8]) -> Result<(), GpuError> {
        if !self.is_host_visible() {
            return Err(GpuError::new("map buffer", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }

        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > self.size) {
            return Err(GpuError::new("map buffer", vk::Result::ERROR_MEMORY_MAP_FAILED));
        }

        device.write_buffer(self.handle, offset, data).op("write buffer")
    }

    /// Destroy the buffer and free its memory.
    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        device.destroy_buffer(self.handle);
    }
}
