//! In-memory device.
//!
//! `HeadlessDevice` implements [`GpuDevice`] without a GPU. Buffers are byte
//! vectors, command buffers are lists of [`RecordedCommand`], and submitted
//! copies are executed when the submission completes. Completion is either
//! immediate (the default) or deferred until [`HeadlessDevice::complete_all`]
//! or `wait_idle`, which lets tests observe frame fences that have not
//! signalled yet.
//!
//! Any operation can be made to fail once with [`HeadlessDevice::fail_next`].

use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;

use crate::gpu::{
    BufferDesc, CompiledPipeline, GpuDevice, PipelineDesc, Submission, SurfaceSupport, SwapchainDesc, VkResult,
};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateBuffer,
    WriteBuffer,
    CreateFence,
    CreateSemaphore,
    WaitForFence,
    WaitIdle,
    AllocateCommandBuffers,
    BeginCommandBuffer,
    Submit,
    SurfaceSupport,
    CreateSwapchain,
    CreateImageView,
    CreateRenderPass,
    CreateFramebuffer,
    Acquire,
    Present,
    CreateShaderModule,
    CreatePipeline,
}

/// A command recorded into a headless command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// Regions are `(src_offset, dst_offset, size)`.
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, regions: Vec<(u64, u64, u64)> },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: (u32, u32),
        clear_color: [f32; 4],
    },
    BindPipeline(vk::Pipeline),
    BindVertexBuffer(vk::Buffer),
    Draw { vertex_count: u32, instance_count: u32 },
    EndRenderPass,
}

/// Counters for what the device has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct HeadlessStats {
    pub submissions: usize,
    pub acquires: usize,
    pub presents: usize,
    pub wait_idles: usize,
    pub swapchains_created: usize,
    pub pipelines_created: usize,
    pub command_buffers_allocated: usize,
    /// Every fence waited on, in order.
    pub fence_waits: Vec<vk::Fence>,
    /// Fences a wait would have blocked on forever.
    pub blocked_on: Vec<vk::Fence>,
}

struct HeadlessBuffer {
    data: Vec<u8>,
    location: MemoryLocation,
}

/// A deterministic device that lives entirely in host memory.
pub struct HeadlessDevice {
    next_handle: u64,
    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_buffers: HashMap<vk::CommandBuffer, Vec<RecordedCommand>>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    image_views: HashSet<vk::ImageView>,
    render_passes: HashSet<vk::RenderPass>,
    framebuffers: HashSet<vk::Framebuffer>,
    shader_modules: HashSet<vk::ShaderModule>,
    pipelines: HashMap<vk::Pipeline, vk::PipelineLayout>,
    in_flight: Vec<Submission>,
    auto_complete: bool,
    support: SurfaceSupport,
    drawable: vk::Extent2D,
    failures: HashMap<FailPoint, VecDeque<Option<vk::Result>>>,
    acquire_suboptimal: bool,
    present_suboptimal: bool,
    forced_image: Option<u32>,
    stats: HeadlessStats,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// An 800x600 surface with three images, FIFO and MAILBOX present modes.
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D { width: 800, height: 600 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };

        Self {
            next_handle: 1,
            buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            command_buffers: HashMap::new(),
            swapchains: HashMap::new(),
            next_image: HashMap::new(),
            image_views: HashSet::new(),
            render_passes: HashSet::new(),
            framebuffers: HashSet::new(),
            shader_modules: HashSet::new(),
            pipelines: HashMap::new(),
            in_flight: Vec::new(),
            auto_complete: true,
            support: SurfaceSupport {
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::R8G8B8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            },
            drawable: vk::Extent2D { width: 800, height: 600 },
            failures: HashMap::new(),
            acquire_suboptimal: false,
            present_suboptimal: false,
            forced_image: None,
            stats: HeadlessStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Make the next call at `point` fail with `result`. Calls queue up.
    pub fn fail_next(&mut self, point: FailPoint, result: vk::Result) {
        self.failures.entry(point).or_default().push_back(Some(result));
    }

    /// Let the next `count` calls at `point` succeed before any queued
    /// failure fires.
    pub fn pass_next(&mut self, point: FailPoint, count: usize) {
        let queue = self.failures.entry(point).or_default();
        queue.extend(std::iter::repeat(None).take(count));
    }

    /// When false, submissions stay in flight until `complete_all` or
    /// `wait_idle`.
    pub fn set_auto_complete(&mut self, auto_complete: bool) {
        self.auto_complete = auto_complete;
    }

    /// Report the next acquire as suboptimal.
    pub fn set_acquire_suboptimal(&mut self) {
        self.acquire_suboptimal = true;
    }

    /// Return `index` from the next acquire, whatever the swapchain holds.
    pub fn force_next_image(&mut self, index: u32) {
        self.forced_image = Some(index);
    }

    /// Report the next present as suboptimal.
    pub fn set_present_suboptimal(&mut self) {
        self.present_suboptimal = true;
    }

    pub fn surface_support_mut(&mut self) -> &mut SurfaceSupport {
        &mut self.support
    }

    /// Change both the surface's current extent and the drawable size.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.support.capabilities.current_extent = vk::Extent2D { width, height };
        self.drawable = vk::Extent2D { width, height };
    }

    pub fn set_drawable_extent(&mut self, extent: vk::Extent2D) {
        self.drawable = extent;
    }

    /// Execute every in-flight submission and signal its fence.
    pub fn complete_all(&mut self) {
        let pending = std::mem::take(&mut self.in_flight);
        for submission in pending {
            self.execute(&submission);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> &HeadlessStats {
        &self.stats
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn recorded(&self, cmd: vk::CommandBuffer) -> &[RecordedCommand] {
        self.command_buffers.get(&cmd).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pipeline_exists(&self, pipeline: vk::Pipeline) -> bool {
        self.pipelines.contains_key(&pipeline)
    }

    /// Number of device objects that have been created and not destroyed.
    pub fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.fences.len()
            + self.semaphores.len()
            + self.command_buffers.len()
            + self.swapchains.len()
            + self.image_views.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.shader_modules.len()
            + self.pipelines.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handle<H: Handle>(&mut self) -> H {
        let raw = self.next_handle;
        self.next_handle += 1;
        H::from_raw(raw)
    }

    fn check(&mut self, point: FailPoint) -> VkResult<()> {
        match self.failures.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(Some(result)) => Err(result),
            _ => Ok(()),
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        if let Some(commands) = self.command_buffers.get_mut(&cmd) {
            commands.push(command);
        }
    }

    fn execute(&mut self, submission: &Submission) {
        let commands = self.command_buffers.get(&submission.command_buffer).cloned().unwrap_or_default();
        for command in commands {
            if let RecordedCommand::CopyBuffer { src, dst, regions } = command {
                for (src_offset, dst_offset, size) in regions {
                    let bytes = match self.buffers.get(&src) {
                        Some(b) => b.data[src_offset as usize..(src_offset + size) as usize].to_vec(),
                        None => continue,
                    };
                    if let Some(target) = self.buffers.get_mut(&dst) {
                        target.data[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&bytes);
                    }
                }
            }
        }

        if submission.fence != vk::Fence::null() {
            self.fences.insert(submission.fence, true);
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> VkResult<vk::Buffer> {
        self.check(FailPoint::CreateBuffer)?;
        let buffer = self.handle();
        self.buffers.insert(
            buffer,
            HeadlessBuffer { data: vec![0; desc.size as usize], location: desc.location },
        );
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        self.check(FailPoint::WriteBuffer)?;
        let target = self.buffers.get_mut(&buffer).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if target.location == MemoryLocation::GpuOnly {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.buffers.remove(&buffer);
    }

    fn create_fence(&mut self, signaled: bool) -> VkResult<vk::Fence> {
        self.check(FailPoint::CreateFence)?;
        let fence = self.handle();
        self.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        self.fences.remove(&fence);
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        self.check(FailPoint::WaitForFence)?;
        self.stats.fence_waits.push(fence);
        match self.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => {
                // A real wait would never return.
                self.stats.blocked_on.push(fence);
                Err(vk::Result::TIMEOUT)
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        match self.fences.get_mut(&fence) {
            Some(state) => {
                *state = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn create_semaphore(&mut self) -> VkResult<vk::Semaphore> {
        self.check(FailPoint::CreateSemaphore)?;
        let semaphore = self.handle();
        self.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphores.remove(&semaphore);
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.check(FailPoint::WaitIdle)?;
        self.stats.wait_idles += 1;
        self.complete_all();
        Ok(())
    }

    fn allocate_command_buffers(&mut self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        self.check(FailPoint::AllocateCommandBuffers)?;
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| self.handle()).collect();
        for &cmd in &buffers {
            self.command_buffers.insert(cmd, Vec::new());
        }
        self.stats.command_buffers_allocated += buffers.len();
        Ok(buffers)
    }

    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]) {
        for cmd in buffers {
            self.command_buffers.remove(cmd);
        }
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer, _one_time: bool) -> VkResult<()> {
        self.check(FailPoint::BeginCommandBuffer)?;
        let commands = self.command_buffers.get_mut(&cmd).ok_or(vk::Result::ERROR_UNKNOWN)?;
        // Beginning a command buffer implicitly resets it.
        commands.clear();
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> VkResult<()> {
        if self.command_buffers.contains_key(&cmd) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn cmd_copy_buffer(&mut self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let regions = regions.iter().map(|r| (r.src_offset, r.dst_offset, r.size)).collect();
        self.record(cmd, RecordedCommand::CopyBuffer { src, dst, regions });
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        self.record(
            cmd,
            RecordedCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                extent: (extent.width, extent.height),
                clear_color,
            },
        );
    }

    fn cmd_bind_pipeline(&mut self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(cmd, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(cmd, RecordedCommand::BindVertexBuffer(buffer));
    }

    fn cmd_draw(&mut self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.record(cmd, RecordedCommand::Draw { vertex_count, instance_count });
    }

    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer) {
        self.record(cmd, RecordedCommand::EndRenderPass);
    }

    fn submit(&mut self, submission: &Submission) -> VkResult<()> {
        self.check(FailPoint::Submit)?;
        if !self.command_buffers.contains_key(&submission.command_buffer) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        self.stats.submissions += 1;
        if self.auto_complete {
            self.execute(submission);
        } else {
            self.in_flight.push(*submission);
        }
        Ok(())
    }

    fn surface_support(&mut self) -> VkResult<SurfaceSupport> {
        self.check(FailPoint::SurfaceSupport)?;
        Ok(self.support.clone())
    }

    fn drawable_extent(&self) -> vk::Extent2D {
        self.drawable
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        self.check(FailPoint::CreateSwapchain)?;
        let swapchain = self.handle();
        let images: Vec<vk::Image> = (0..desc.image_count).map(|_| self.handle()).collect();
        self.swapchains.insert(swapchain, images);
        self.next_image.insert(swapchain, 0);
        self.stats.swapchains_created += 1;
        Ok(swapchain)
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.swapchains.get(&swapchain).cloned().ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        self.swapchains.remove(&swapchain);
        self.next_image.remove(&swapchain);
    }

    fn create_image_view(&mut self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        self.check(FailPoint::CreateImageView)?;
        let view = self.handle();
        self.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.image_views.remove(&view);
    }

    fn create_render_pass(&mut self, _format: vk::Format) -> VkResult<vk::RenderPass> {
        self.check(FailPoint::CreateRenderPass)?;
        let render_pass = self.handle();
        self.render_passes.insert(render_pass);
        Ok(render_pass)
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.render_passes.remove(&render_pass);
    }

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        _view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        self.check(FailPoint::CreateFramebuffer)?;
        if !self.render_passes.contains(&render_pass) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let framebuffer = self.handle();
        self.framebuffers.insert(framebuffer);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.framebuffers.remove(&framebuffer);
    }

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, _signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.check(FailPoint::Acquire)?;
        self.stats.acquires += 1;
        let count = self.swapchains.get(&swapchain).map(Vec::len).ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)? as u32;
        let next = self.next_image.entry(swapchain).or_insert(0);
        let index = *next;
        *next = (index + 1) % count;
        let suboptimal = std::mem::take(&mut self.acquire_suboptimal);
        Ok((self.forced_image.take().unwrap_or(index), suboptimal))
    }

    fn present(&mut self, swapchain: vk::SwapchainKHR, _image_index: u32, _wait: vk::Semaphore) -> VkResult<bool> {
        self.check(FailPoint::Present)?;
        if !self.swapchains.contains_key(&swapchain) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        self.stats.presents += 1;
        Ok(std::mem::take(&mut self.present_suboptimal))
    }

    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        self.check(FailPoint::CreateShaderModule)?;
        if code.is_empty() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let module = self.handle();
        self.shader_modules.insert(module);
        Ok(module)
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.shader_modules.remove(&module);
    }

    fn create_graphics_pipeline(&mut self, desc: &PipelineDesc<'_>) -> VkResult<CompiledPipeline> {
        self.check(FailPoint::CreatePipeline)?;
        if !self.render_passes.contains(&desc.render_pass) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if desc.stages.iter().any(|s| !self.shader_modules.contains(&s.module())) {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let layout = self.handle();
        let pipeline = self.handle();
        self.pipelines.insert(pipeline, layout);
        self.stats.pipelines_created += 1;
        Ok(CompiledPipeline { layout, pipeline })
    }

    fn destroy_pipeline(&mut self, compiled: CompiledPipeline) {
        self.pipelines.remove(&compiled.pipeline);
    }
}
