//! The device seam.
//!
//! Every Vulkan call the renderer core makes goes through [`GpuDevice`].
//! [`crate::vulkan::VulkanDevice`] implements it on top of ash and
//! gpu-allocator; [`crate::headless::HeadlessDevice`] implements it in memory
//! so the pool, registry and frame state machine run without a GPU.
//!
//! Handles are the plain `vk` handle types. Errors are the raw `vk::Result`
//! the driver returned; callers attach context with
//! [`crate::error::VkResultExt`].

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::pipeline::ShaderStage;

pub type VkResult<T> = Result<T, vk::Result>;

/// Parameters for a buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// One queue submission: a single command buffer, optional wait/signal
/// semaphores and the fence signalled on completion.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// What the presentation surface currently supports.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Resolved swapchain parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Everything needed to compile one drawable pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    pub stages: &'a [ShaderStage],
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
}

/// A compiled pipeline and the layout it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

/// Device operations used by the renderer core.
///
/// All waits are unbounded. Implementations are driven from a single
/// thread.
pub trait GpuDevice {
    // Memory

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer>;

    /// Copy `data` into host-visible buffer memory at `offset`.
    fn write_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()>;

    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    // Synchronization

    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);
    fn wait_idle(&mut self) -> VkResult<()>;

    // Command buffers

    fn allocate_command_buffers(&mut self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()>;
    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    );
    fn cmd_bind_pipeline(&mut self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_vertex_buffer(&mut self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn cmd_draw(&mut self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer);

    /// Submit to the graphics queue.
    fn submit(&mut self, submission: &Submission) -> VkResult<()>;

    // Presentation surface

    fn surface_support(&mut self) -> VkResult<SurfaceSupport>;

    /// Size of the window's drawable area, used when the surface leaves the
    /// extent up to the swapchain.
    fn drawable_extent(&self) -> vk::Extent2D;

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);
    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);
    fn create_render_pass(&mut self, format: vk::Format) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);

    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> VkResult<(u32, bool)>;

    /// Returns whether the swapchain is suboptimal.
    fn present(&mut self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;

    // Pipelines

    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&mut self, module: vk::ShaderModule);
    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc<'_>) -> VkResult<CompiledPipeline>;
    fn destroy_pipeline(&mut self, compiled: CompiledPipeline);
}
