//! Vulkan backend: context bring-up, memory and the [`VulkanDevice`]
//! implementation of [`crate::gpu::GpuDevice`].

pub mod context;
pub mod device;
pub mod memory;
pub mod surface;

pub use context::VulkanContext;
pub use device::VulkanDevice;
pub use memory::MemoryManager;

use ash::vk;
use std::ffi::CStr;

/// Application name reported to the driver.
pub const APP_NAME: &CStr = c"quadrant";

/// Engine name reported to the driver.
pub const ENGINE_NAME: &CStr = c"quadrant-renderer";

/// Lowest instance version the backend runs on.
pub const REQUIRED_VK_VERSION: u32 = vk::API_VERSION_1_1;
