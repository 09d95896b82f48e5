//! [`GpuDevice`] on top of ash and gpu-allocator.

use ash::vk;
use log::{debug, warn};

use super::memory::MemoryManager;
use super::surface::query_support;
use super::VulkanContext;
use crate::error::{ContextError, VkResultExt};
use crate::gpu::{
    BufferDesc, CompiledPipeline, GpuDevice, PipelineDesc, Submission, SurfaceSupport, SwapchainDesc, VkResult,
};
use crate::pool::Vertex;

/// A real device. Owns the context, the memory manager and the single
/// command pool every command buffer is allocated from.
pub struct VulkanDevice {
    // Drop order matters: allocations are freed before the context
    // destroys the logical device.
    memory: MemoryManager,
    command_pool: vk::CommandPool,
    drawable: vk::Extent2D,
    ctx: VulkanContext,
}

impl VulkanDevice {
    /// `drawable` is the window's current inner size in pixels.
    pub fn new(ctx: VulkanContext, drawable: vk::Extent2D) -> Result<Self, ContextError> {
        let memory = MemoryManager::new(&ctx)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }.op("create command pool")?;

        Ok(Self { memory, command_pool, drawable, ctx })
    }

    /// Record the window's new inner size, used when the surface leaves the
    /// extent up to the swapchain.
    pub fn set_drawable_extent(&mut self, extent: vk::Extent2D) {
        self.drawable = extent;
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    fn device(&self) -> &ash::Device {
        &self.ctx.device
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.device.device_wait_idle() {
                warn!("device wait idle failed during teardown: {}", e);
            }
            self.ctx.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer> {
        self.memory.create_buffer(desc.size, desc.usage, desc.location, desc.name)
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        self.memory.write(buffer, offset, data)
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.memory.destroy_buffer(buffer);
    }

    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        unsafe { self.device().create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device().destroy_fence(fence, None) }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device().wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device().reset_fences(&[fence]) }
    }

    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore> {
        unsafe { self.device().create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device().destroy_semaphore(semaphore, None) }
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.ctx.wait_idle()
    }

    fn allocate_command_buffers(&mut self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device().allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device().free_command_buffers(self.command_pool, buffers) }
        }
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer, one_time: bool) -> VkResult<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        unsafe {
            self.device()
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default().flags(flags))
        }
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device().end_command_buffer(cmd) }
    }

    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device().cmd_copy_buffer(cmd, src, dst, regions) }
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
            .clear_values(&clear_values);
        unsafe {
            self.device()
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_bind_pipeline(&mut self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device()
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        unsafe { self.device().cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[0]) }
    }

    fn cmd_draw(&mut self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        unsafe { self.device().cmd_draw(cmd, vertex_count, instance_count, 0, 0) }
    }

    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer) {
        unsafe { self.device().cmd_end_render_pass(cmd) }
    }

    fn submit(&mut self, submission: &Submission) -> VkResult<()> {
        let command_buffers = [submission.command_buffer];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = submission.wait.into_iter().unzip();
        let signal_semaphores: Vec<vk::Semaphore> = submission.signal.into_iter().collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device()
                .queue_submit(self.ctx.graphics_queue, &[submit_info], submission.fence)
        }
    }

    fn surface_support(&mut self) -> VkResult<SurfaceSupport> {
        query_support(&self.ctx)
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        self.drawable
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let families = [self.ctx.graphics_family, self.ctx.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.ctx.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        create_info = if families[0] != families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { self.ctx.swapchain_loader.create_swapchain(&create_info, None)? };
        debug!(
            "created swapchain {}x{} ({} images requested)",
            desc.extent.width, desc.extent.height, desc.image_count
        );
        Ok(swapchain)
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.ctx.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        unsafe { self.ctx.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device().create_image_view(&create_info, None) }
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device().destroy_image_view(view, None) }
    }

    fn create_render_pass(&mut self, format: vk::Format) -> VkResult<vk::RenderPass> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        // The image-available wait happens at color output, so the layout
        // transition must not start earlier.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe { self.device().create_render_pass(&create_info, None) }
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        unsafe { self.device().destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let attachments = [view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device().create_framebuffer(&create_info, None) }
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        unsafe { self.device().destroy_framebuffer(framebuffer, None) }
    }

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.ctx
                .swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        }
    }

    fn present(&mut self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present_info)
        }
    }

    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device().create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        unsafe { self.device().destroy_shader_module(module, None) }
    }

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc<'_>) -> VkResult<CompiledPipeline> {
        let layout = unsafe {
            self.device()
                .create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default(), None)?
        };

        let stages: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc.stages.iter().map(|s| s.create_info()).collect();

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: desc.extent }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .layout(layout)
            .render_pass(desc.render_pass)
            .subpass(0);

        let created = unsafe {
            self.device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };

        match created {
            Ok(pipelines) => Ok(CompiledPipeline { layout, pipeline: pipelines[0] }),
            Err((_, result)) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                Err(result)
            }
        }
    }

    fn destroy_pipeline(&mut self, compiled: CompiledPipeline) {
        unsafe {
            self.device().destroy_pipeline(compiled.pipeline, None);
            self.device().destroy_pipeline_layout(compiled.layout, None);
        }
    }
}
