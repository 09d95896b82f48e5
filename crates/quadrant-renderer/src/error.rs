//! Error types for every layer of the renderer.
//!
//! Raw Vulkan failures are wrapped in [`GpuError`] together with the name of
//! the operation that produced them. Each component then has its own enum so
//! callers can tell capacity rejections apart from fatal device failures.

use ash::vk;
use thiserror::Error;

use crate::pool::{DirtyMask, PrimitiveId};

/// A failed Vulkan call and the operation it belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed: {result}")]
pub struct GpuError {
    pub op: &'static str,
    pub result: vk::Result,
}

impl GpuError {
    pub fn new(op: &'static str, result: vk::Result) -> Self {
        Self { op, result }
    }
}

/// Attach an operation name to a raw `vk::Result` error.
pub trait VkResultExt<T> {
    fn op(self, op: &'static str) -> Result<T, GpuError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn op(self, op: &'static str) -> Result<T, GpuError> {
        self.map_err(|result| GpuError { op, result })
    }
}

/// Failures while bringing up the Vulkan instance, surface and device.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
    #[error("Vulkan {major}.{minor} required, found {found_major}.{found_minor}")]
    ApiVersion { major: u32, minor: u32, found_major: u32, found_minor: u32 },
    #[error("no Vulkan device can present to this surface")]
    NoSuitableDevice,
    #[error("failed to create memory allocator: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),
}

/// Invalid renderer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pool capacity must be at least 1")]
    ZeroCapacity,
    #[error("pool capacity {0} does not fit a single draw call")]
    CapacityTooLarge(usize),
    #[error("pipeline ceiling must be at least 1")]
    ZeroPipelineCeiling,
    #[error("frames in flight must be between 1 and {max}, got {got}")]
    FramesInFlight { got: usize, max: usize },
}

/// Errors from the quad pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to allocate pool resources")]
    Allocation(#[source] GpuError),
    #[error("quad pool is full ({capacity} quads)")]
    Exhausted { capacity: usize },
    #[error("primitive {0} is not live")]
    NotLive(PrimitiveId),
    #[error("partial upload ({mask:?}) at offset {offset} is not implemented")]
    PartialUpload { offset: vk::DeviceSize, mask: DirtyMask },
    #[error("staging transfer failed")]
    Transfer(#[source] GpuError),
}

/// Errors from the pipeline registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("pipeline registry is full ({ceiling} pipelines)")]
    Full { ceiling: usize },
    #[error("no pipeline registered under handle {0}")]
    UnknownHandle(u32),
    #[error("failed to compile pipeline {handle}")]
    Compile {
        handle: u32,
        #[source]
        source: GpuError,
    },
    #[error("invalid SPIR-V bytecode: {0}")]
    InvalidSpirv(String),
    #[error("shader entry point contains an interior NUL byte")]
    InvalidEntryPoint,
    #[error("failed to create shader module")]
    ShaderModule(#[source] GpuError),
}

/// What went wrong while rebuilding the presentation surface.
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Pipelines(#[from] RegistryError),
}

/// Errors surfaced by the frame pipeline.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("renderer setup failed")]
    Setup(#[source] GpuError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Pipeline(#[from] RegistryError),
    #[error("waiting for frame fence failed: {0}")]
    FenceWait(vk::Result),
    #[error("command buffer recording failed")]
    Record(#[source] GpuError),
    #[error("failed to acquire swapchain image: {0}")]
    AcquireFailed(vk::Result),
    #[error("no command buffer for swapchain image {image_index} ({image_count} recorded)")]
    MissingCommandBuffer { image_index: u32, image_count: usize },
    #[error("device lost during submission")]
    DeviceLost,
    #[error("out of device memory during submission")]
    OutOfDeviceMemory,
    #[error("out of host memory during submission")]
    OutOfHostMemory,
    #[error("queue submission failed: {0}")]
    SubmitFailed(vk::Result),
    #[error("presentation failed: {0}")]
    PresentFailed(vk::Result),
    #[error("surface rebuild failed")]
    SurfaceRebuild(#[source] RebuildError),
}

impl FrameError {
    /// Classify a queue submission failure.
    pub fn from_submit(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => FrameError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => FrameError::OutOfHostMemory,
            other => FrameError::SubmitFailed(other),
        }
    }
}
