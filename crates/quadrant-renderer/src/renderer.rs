//! The frame pipeline.
//!
//! [`FramePipeline`] owns the device, the quad pool, the pipeline registry,
//! the frame-in-flight ring and the surface objects, and drives them through
//! one frame per [`FramePipeline::draw_frame`] call:
//!
//! 1. wait on the current slot's fence
//! 2. flush pending quad uploads and re-record the per-image command buffers
//! 3. acquire a swapchain image
//! 4. submit that image's command buffer
//! 5. present, rebuilding the surface if it went stale
//! 6. advance to the next slot
//!
//! Surface lifecycle: `Valid -> Invalidated -> Rebuilding -> Valid`. A
//! surface with zero drawable area is never rebuilt; drawing is suspended
//! until the window is restored.

use ash::vk;
use log::{debug, error, info, trace, warn};

use crate::config::RendererConfig;
use crate::error::{FrameError, GpuError, PoolError, RebuildError, RegistryError, VkResultExt};
use crate::frame::{FrameRing, FrameSlot};
use crate::gpu::{GpuDevice, Submission};
use crate::pipeline::{PipelineIndex, PipelineRegistry, ShaderKind, ShaderStage};
use crate::pool::{PrimitiveId, QuadPool, Vertex, VERTICES_PER_QUAD};
use crate::swapchain::{resolve_swapchain, SurfaceState};

/// Where the presentation surface is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// Surface objects match the surface and can be drawn with.
    Valid,
    /// Surface objects are stale and must be rebuilt before the next draw.
    Invalidated,
    /// A rebuild is in progress.
    Rebuilding,
}

/// Double-buffered quad renderer over a [`GpuDevice`].
pub struct FramePipeline<D: GpuDevice> {
    device: D,
    config: RendererConfig,
    pool: QuadPool,
    registry: PipelineRegistry,
    ring: FrameRing,
    surface: SurfaceState,
    shader_stages: Vec<ShaderStage>,
    status: SurfaceStatus,
    active_pipeline: Option<PipelineIndex>,
    resize_pending: bool,
    minimized: bool,
}

impl<D: GpuDevice> FramePipeline<D> {
    /// Validate the configuration, create the pool and the frame ring and
    /// build the surface objects.
    ///
    /// On failure everything created so far is released and the device is
    /// dropped.
    pub fn new(device: D, config: RendererConfig) -> Result<Self, FrameError> {
        Self::try_new(device, config).map_err(|(_, e)| e)
    }

    /// Like [`FramePipeline::new`], but a failure hands the device back with
    /// everything created on it already released.
    pub fn try_new(mut device: D, config: RendererConfig) -> Result<Self, (D, FrameError)> {
        if let Err(e) = config.validate() {
            return Err((device, e.into()));
        }

        let pool = match QuadPool::new(&mut device, config.pool_capacity) {
            Ok(pool) => pool,
            Err(e) => return Err((device, e.into())),
        };

        let ring = match FrameRing::new(&mut device, config.frames_in_flight) {
            Ok(ring) => ring,
            Err(e) => {
                pool.destroy(&mut device);
                return Err((device, FrameError::Setup(e)));
            }
        };

        let mut pipeline = Self {
            device,
            registry: PipelineRegistry::new(config.pipeline_ceiling),
            config,
            pool,
            ring,
            surface: SurfaceState::empty(),
            shader_stages: Vec::new(),
            status: SurfaceStatus::Invalidated,
            active_pipeline: None,
            resize_pending: false,
            minimized: false,
        };

        if let Err(e) = pipeline.rebuild_surface() {
            return Err((pipeline.shutdown(), e));
        }

        info!(
            "frame pipeline ready: {} quad slots, {} frames in flight, {} pipelines max",
            config.pool_capacity, config.frames_in_flight, config.pipeline_ceiling
        );
        Ok(pipeline)
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Stage a quad. It is uploaded and drawn from the next `draw_frame`.
    pub fn insert_primitive(&mut self, vertices: &[Vertex; 6]) -> Result<PrimitiveId, PoolError> {
        self.pool.insert(&mut self.device, vertices)
    }

    pub fn remove_primitive(&mut self, id: PrimitiveId) -> Result<(), PoolError> {
        self.pool.remove(&mut self.device, id)
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Create a shader stage from SPIR-V bytes. The module is destroyed at
    /// shutdown.
    pub fn create_shader_stage(
        &mut self,
        kind: ShaderKind,
        spirv: &[u8],
        entry_point: &str,
    ) -> Result<ShaderStage, FrameError> {
        let stage = ShaderStage::from_spirv(&mut self.device, kind, spirv, entry_point)?;
        self.shader_stages.push(stage.clone());
        Ok(stage)
    }

    /// Register a pipeline against the current surface.
    pub fn create_pipeline(&mut self, vertex: &ShaderStage, fragment: &ShaderStage) -> Result<PipelineIndex, FrameError> {
        let handle = self.registry.create(
            &mut self.device,
            vertex,
            fragment,
            self.surface.extent,
            self.surface.render_pass,
        )?;
        Ok(handle)
    }

    /// Unregister a pipeline. If it is the one being drawn with, the
    /// command buffers fall back to a clear-only pass.
    pub fn remove_pipeline(&mut self, handle: PipelineIndex) -> Result<(), FrameError> {
        self.device.wait_idle().op("wait idle before pipeline removal").map_err(FrameError::Record)?;
        self.registry.remove(&mut self.device, handle)?;

        if self.active_pipeline == Some(handle) {
            self.active_pipeline = None;
            if !self.surface.is_empty() {
                self.record_command_buffers().map_err(FrameError::Record)?;
            }
        }
        Ok(())
    }

    /// Select the pipeline every per-image command buffer draws with and
    /// record them.
    pub fn record_frame(&mut self, handle: PipelineIndex) -> Result<(), FrameError> {
        if self.registry.lookup(handle).is_none() {
            return Err(RegistryError::UnknownHandle(handle.index()).into());
        }
        self.active_pipeline = Some(handle);

        if self.surface.is_empty() {
            // Recorded by the next rebuild.
            return Ok(());
        }

        // Command buffers may still be executing.
        self.device.wait_idle().op("wait idle before recording").map_err(FrameError::Record)?;
        self.record_command_buffers().map_err(FrameError::Record)
    }

    /// Record every per-image command buffer: one render pass clearing the
    /// image and, when a compiled pipeline is selected, the pool's draw.
    fn record_command_buffers(&mut self) -> Result<(), GpuError> {
        let pipeline = self
            .active_pipeline
            .and_then(|h| self.registry.lookup(h))
            .and_then(|p| p.pipeline());

        let device = &mut self.device;
        let surface = &self.surface;

        for (&cmd, &framebuffer) in surface.command_buffers.iter().zip(&surface.framebuffers) {
            device.begin_command_buffer(cmd, false).op("begin frame commands")?;
            device.cmd_begin_render_pass(cmd, surface.render_pass, framebuffer, surface.extent, self.config.clear_color);
            if let Some(pipeline) = pipeline {
                device.cmd_bind_pipeline(cmd, pipeline);
                self.pool.issue_draw_commands(device, cmd);
            }
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd).op("end frame commands")?;
        }

        debug!(
            "recorded {} command buffers ({} vertices)",
            surface.command_buffers.len(),
            if pipeline.is_some() { self.pool.high_water_mark() * VERTICES_PER_QUAD } else { 0 }
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Render and present one frame.
    ///
    /// Returns `Ok(())` without drawing while minimized or when the surface
    /// went stale and was rebuilt instead.
    pub fn draw_frame(&mut self) -> Result<(), FrameError> {
        if self.minimized {
            trace!("minimized, skipping frame");
            return Ok(());
        }

        if self.status != SurfaceStatus::Valid || self.resize_pending {
            self.rebuild_surface()?;
            if self.status != SurfaceStatus::Valid {
                return Ok(());
            }
        }

        let slot = self.ring.current();
        self.device.wait_for_fence(slot.in_flight).map_err(FrameError::FenceWait)?;

        if self.pool.flush_required() {
            self.pool.flush(&mut self.device)?;
            self.device.wait_idle().op("wait idle after flush").map_err(FrameError::Record)?;
            self.surface
                .reallocate_command_buffers(&mut self.device)
                .map_err(FrameError::Record)?;
            self.record_command_buffers().map_err(FrameError::Record)?;
        }

        let image_index = match self.device.acquire_next_image(self.surface.swapchain, slot.image_available) {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                info!("swapchain out of date on acquire");
                self.status = SurfaceStatus::Invalidated;
                return self.rebuild_surface();
            }
            Err(e) => {
                error!("failed to acquire swapchain image: {}", e);
                return Err(FrameError::AcquireFailed(e));
            }
        };

        self.submit(slot, image_index)?;

        let present = self.device.present(self.surface.swapchain, image_index, slot.render_finished);
        self.ring.advance();

        match present {
            Ok(false) if !self.resize_pending => Ok(()),
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                info!("surface stale after present, rebuilding");
                self.status = SurfaceStatus::Invalidated;
                self.rebuild_surface()
            }
            Err(e) => {
                error!("present failed: {}", e);
                Err(FrameError::PresentFailed(e))
            }
        }
    }

    fn submit(&mut self, slot: FrameSlot, image_index: u32) -> Result<(), FrameError> {
        let command_buffer = self
            .surface
            .command_buffers
            .get(image_index as usize)
            .copied()
            .ok_or(FrameError::MissingCommandBuffer {
                image_index,
                image_count: self.surface.command_buffers.len(),
            })?;

        self.device.reset_fence(slot.in_flight).map_err(FrameError::FenceWait)?;

        let submission = Submission {
            command_buffer,
            wait: Some((slot.image_available, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)),
            signal: Some(slot.render_finished),
            fence: slot.in_flight,
        };

        self.device.submit(&submission).map_err(|e| {
            let err = FrameError::from_submit(e);
            error!(
                "queue submission failed: {} ({} live quads, high-water mark {})",
                e,
                self.pool.len(),
                self.pool.high_water_mark()
            );
            err
        })
    }

    // ------------------------------------------------------------------
    // Surface lifecycle
    // ------------------------------------------------------------------

    /// Flag the surface for a rebuild at the next frame. Sticky until a
    /// rebuild succeeds.
    pub fn notify_resized(&mut self) {
        self.resize_pending = true;
    }

    /// Suspend or resume drawing. A restored surface is rebuilt by the next
    /// `draw_frame`.
    pub fn notify_minimized(&mut self, minimized: bool) {
        if self.minimized != minimized {
            debug!("surface {}", if minimized { "minimized" } else { "restored" });
        }
        self.minimized = minimized;
        if !minimized {
            self.resize_pending = true;
        }
    }

    /// Tear down and recreate every surface-dependent object, recompile all
    /// pipelines and re-record the command buffers.
    ///
    /// Pending quad uploads are untouched. A zero-sized surface leaves the
    /// state `Invalidated` and marks the pipeline minimized.
    pub fn rebuild_surface(&mut self) -> Result<(), FrameError> {
        self.status = SurfaceStatus::Rebuilding;
        match self.rebuild() {
            Ok(true) => {
                self.status = SurfaceStatus::Valid;
                self.resize_pending = false;
                Ok(())
            }
            Ok(false) => {
                self.status = SurfaceStatus::Invalidated;
                Ok(())
            }
            Err(e) => {
                self.status = SurfaceStatus::Invalidated;
                error!("surface rebuild failed: {}", e);
                Err(FrameError::SurfaceRebuild(e))
            }
        }
    }

    /// Returns false when the surface has no drawable area.
    fn rebuild(&mut self) -> Result<bool, RebuildError> {
        self.device.wait_idle().op("wait idle before rebuild")?;

        self.registry.destroy_all(&mut self.device);
        self.surface.destroy(&mut self.device);

        let support = self.device.surface_support().op("query surface support")?;
        let desc = resolve_swapchain(&support, self.device.drawable_extent(), &self.config);

        if desc.extent.width == 0 || desc.extent.height == 0 {
            info!("surface has zero area, suspending drawing");
            self.minimized = true;
            return Ok(false);
        }

        self.surface = SurfaceState::build(&mut self.device, &desc)?;
        self.registry.rebuild_all(&mut self.device, desc.extent, self.surface.render_pass)?;
        self.record_command_buffers()?;

        info!(
            "surface rebuilt: {}x{}, {:?}, {:?}, {} images",
            desc.extent.width,
            desc.extent.height,
            desc.format.format,
            desc.present_mode,
            self.surface.image_count()
        );
        Ok(true)
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&mut self) -> Result<(), FrameError> {
        self.device.wait_idle().op("wait idle").map_err(FrameError::Record)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn status(&self) -> SurfaceStatus {
        self.status
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn is_resize_pending(&self) -> bool {
        self.resize_pending
    }

    pub fn active_pipeline(&self) -> Option<PipelineIndex> {
        self.active_pipeline
    }

    pub fn pool(&self) -> &QuadPool {
        &self.pool
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn surface(&self) -> &SurfaceState {
        &self.surface
    }

    pub fn frame_slots(&self) -> &[FrameSlot] {
        self.ring.slots()
    }

    pub fn current_frame(&self) -> usize {
        self.ring.current_index()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Wait for the device, destroy every object the pipeline created and
    /// hand the device back.
    pub fn shutdown(self) -> D {
        let Self { mut device, pool, mut registry, ring, mut surface, shader_stages, .. } = self;

        if let Err(e) = device.wait_idle() {
            warn!("wait idle at shutdown failed: {}", e);
        }

        registry.clear(&mut device);
        surface.destroy(&mut device);
        for stage in shader_stages {
            stage.destroy(&mut device);
        }
        ring.destroy(&mut device);
        pool.destroy(&mut device);

        info!("frame pipeline shut down");
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{FailPoint, HeadlessDevice, RecordedCommand};
    use crate::pool::{rect, BYTES_PER_QUAD};

    fn spirv() -> Vec<u8> {
        [0x0723_0203u32, 0x0001_0000, 0, 1, 0].iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn quad(i: usize) -> [Vertex; 6] {
        let x = i as f32 * 0.1 - 1.0;
        rect([x, -0.5], [x + 0.05, 0.5], [1.0, 1.0, 1.0, 1.0])
    }

    fn renderer(capacity: usize) -> FramePipeline<HeadlessDevice> {
        let config = RendererConfig::default().with_pool_capacity(capacity);
        FramePipeline::new(HeadlessDevice::new(), config).unwrap()
    }

    fn with_pipeline(capacity: usize) -> (FramePipeline<HeadlessDevice>, PipelineIndex) {
        let mut r = renderer(capacity);
        let vs = r.create_shader_stage(ShaderKind::Vertex, &spirv(), "main").unwrap();
        let fs = r.create_shader_stage(ShaderKind::Fragment, &spirv(), "main").unwrap();
        let handle = r.create_pipeline(&vs, &fs).unwrap();
        r.record_frame(handle).unwrap();
        (r, handle)
    }

    fn draw_counts(r: &FramePipeline<HeadlessDevice>) -> Vec<u32> {
        r.surface()
            .command_buffers
            .iter()
            .flat_map(|&cmd| r.device().recorded(cmd).to_vec())
            .filter_map(|c| match c {
                RecordedCommand::Draw { vertex_count, .. } => Some(vertex_count),
                _ => None,
            })
            .collect()
    }

    // ============================================================
    // Setup / teardown
    // ============================================================

    #[test]
    fn test_new_builds_valid_surface() {
        let r = renderer(16);
        assert_eq!(r.status(), SurfaceStatus::Valid);
        assert_eq!(r.frame_slots().len(), 2);
        assert_eq!(r.surface().image_count(), 3);
        assert_eq!(r.pool().capacity(), 16);
        r.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected_before_allocation() {
        let config = RendererConfig::default().with_pool_capacity(0);
        let err = FramePipeline::new(HeadlessDevice::new(), config).err().unwrap();
        assert!(matches!(err, FrameError::Config(_)));
    }

    #[test]
    fn test_setup_failure_releases_everything() {
        let mut device = HeadlessDevice::new();
        device.fail_next(FailPoint::CreateRenderPass, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let (device, err) = FramePipeline::try_new(device, RendererConfig::default()).err().unwrap();
        assert!(matches!(err, FrameError::SurfaceRebuild(_)));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_frame_ring_failure_releases_pool() {
        let mut device = HeadlessDevice::new();
        device.fail_next(FailPoint::CreateSemaphore, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let (device, err) = FramePipeline::try_new(device, RendererConfig::default()).err().unwrap();
        assert!(matches!(err, FrameError::Setup(_)));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_shutdown_releases_every_object() {
        let (mut r, _) = with_pipeline(16);
        for i in 0..5 {
            r.insert_primitive(&quad(i)).unwrap();
        }
        r.draw_frame().unwrap();
        r.draw_frame().unwrap();

        let device = r.shutdown();
        assert_eq!(device.live_objects(), 0);
    }

    // ============================================================
    // Recording
    // ============================================================

    #[test]
    fn test_clear_only_pass_without_pipeline() {
        let r = renderer(4);
        let cmd = r.surface().command_buffers[0];
        let recorded = r.device().recorded(cmd);
        assert_eq!(recorded.len(), 2);
        match &recorded[0] {
            RecordedCommand::BeginRenderPass { clear_color, extent, .. } => {
                assert_eq!(*clear_color, [0.0, 0.0, 0.0, 1.0]);
                assert_eq!(*extent, (800, 600));
            }
            other => panic!("expected a render pass, got {:?}", other),
        }
        assert_eq!(recorded[1], RecordedCommand::EndRenderPass);
        r.shutdown();
    }

    #[test]
    fn test_record_frame_unknown_handle() {
        let mut r = renderer(4);
        let err = r.record_frame(PipelineIndex::INVALID).unwrap_err();
        assert!(matches!(err, FrameError::Pipeline(RegistryError::UnknownHandle(_))));
        assert_eq!(r.active_pipeline(), None);
        r.shutdown();
    }

    #[test]
    fn test_flush_then_rerecord_draws_high_water_mark() {
        let (mut r, _) = with_pipeline(16);
        for i in 0..3 {
            r.insert_primitive(&quad(i)).unwrap();
        }
        let allocated = r.device().stats().command_buffers_allocated;
        r.draw_frame().unwrap();

        assert!(!r.pool().flush_required());
        // One transfer buffer, then a fresh buffer per swapchain image.
        assert_eq!(r.device().stats().command_buffers_allocated, allocated + 1 + 3);
        assert_eq!(draw_counts(&r), vec![18, 18, 18]);

        let vertex_buffer = r.pool().vertex_buffer();
        let uploaded = &r.device().buffer_contents(vertex_buffer).unwrap()[..BYTES_PER_QUAD as usize];
        assert_eq!(uploaded, bytemuck::cast_slice::<Vertex, u8>(&quad(0)));
        r.shutdown();
    }

    #[test]
    fn test_removed_pipeline_falls_back_to_clear() {
        let (mut r, handle) = with_pipeline(4);
        r.insert_primitive(&quad(0)).unwrap();
        r.draw_frame().unwrap();
        assert_eq!(draw_counts(&r), vec![6, 6, 6]);

        let idles = r.device().stats().wait_idles;
        r.remove_pipeline(handle).unwrap();
        assert_eq!(r.device().stats().wait_idles, idles + 1);
        assert_eq!(r.active_pipeline(), None);
        assert!(draw_counts(&r).is_empty());
        r.shutdown();
    }

    // ============================================================
    // Frame pacing
    // ============================================================

    #[test]
    fn test_frame_n_plus_one_waits_on_slot_zero() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().set_auto_complete(false);
        let slot0 = r.frame_slots()[0].in_flight;

        r.draw_frame().unwrap();
        r.draw_frame().unwrap();
        assert_eq!(r.device().stats().submissions, 2);
        assert_eq!(r.device().in_flight(), 2);

        let err = r.draw_frame().unwrap_err();
        assert!(matches!(err, FrameError::FenceWait(vk::Result::TIMEOUT)));
        assert_eq!(r.device().stats().fence_waits.last(), Some(&slot0));
        assert_eq!(r.device().stats().blocked_on, vec![slot0]);
        assert_eq!(r.device().stats().submissions, 2);

        r.device_mut().complete_all();
        assert_eq!(r.device().in_flight(), 0);
        r.draw_frame().unwrap();
        assert_eq!(r.device().stats().submissions, 3);
        r.shutdown();
    }

    #[test]
    fn test_slots_alternate() {
        let (mut r, _) = with_pipeline(4);
        assert_eq!(r.current_frame(), 0);
        r.draw_frame().unwrap();
        assert_eq!(r.current_frame(), 1);
        r.draw_frame().unwrap();
        assert_eq!(r.current_frame(), 0);
        r.shutdown();
    }

    // ============================================================
    // Surface invalidation
    // ============================================================

    #[test]
    fn test_rebuild_preserves_handles_and_pending_uploads() {
        let (mut r, handle) = with_pipeline(16);
        for i in 0..3 {
            r.insert_primitive(&quad(i)).unwrap();
        }
        r.draw_frame().unwrap();
        r.insert_primitive(&quad(3)).unwrap();
        r.insert_primitive(&quad(4)).unwrap();

        let old_buffers = r.surface().command_buffers.clone();
        let old_pipeline = r.registry().lookup(handle).unwrap().pipeline().unwrap();
        let hwm = r.pool().high_water_mark();

        r.rebuild_surface().unwrap();

        assert_eq!(r.status(), SurfaceStatus::Valid);
        assert!(r.surface().command_buffers.iter().all(|cmd| !old_buffers.contains(cmd)));
        let rebuilt = r.registry().lookup(handle).unwrap().pipeline().unwrap();
        assert_ne!(rebuilt, old_pipeline);
        assert_eq!(r.active_pipeline(), Some(handle));
        assert_eq!(r.pool().high_water_mark(), hwm);
        assert_eq!(r.pool().pending_uploads().len(), 2);
        r.shutdown();
    }

    #[test]
    fn test_out_of_date_acquire_rebuilds_and_skips() {
        let (mut r, handle) = with_pipeline(16);
        r.insert_primitive(&quad(0)).unwrap();
        r.draw_frame().unwrap();

        let swapchains = r.device().stats().swapchains_created;
        let submissions = r.device().stats().submissions;
        let hwm = r.pool().high_water_mark();
        r.device_mut().fail_next(FailPoint::Acquire, vk::Result::ERROR_OUT_OF_DATE_KHR);

        r.draw_frame().unwrap();

        assert_eq!(r.status(), SurfaceStatus::Valid);
        assert_eq!(r.device().stats().swapchains_created, swapchains + 1);
        assert_eq!(r.device().stats().submissions, submissions);
        assert!(r.registry().lookup(handle).unwrap().pipeline().is_some());
        assert_eq!(r.pool().high_water_mark(), hwm);
        assert_eq!(draw_counts(&r), vec![6, 6, 6]);
        r.shutdown();
    }

    #[test]
    fn test_suboptimal_present_rebuilds() {
        let (mut r, _) = with_pipeline(4);
        let swapchains = r.device().stats().swapchains_created;
        r.device_mut().set_present_suboptimal();

        r.draw_frame().unwrap();

        assert_eq!(r.device().stats().presents, 1);
        assert_eq!(r.device().stats().swapchains_created, swapchains + 1);
        assert_eq!(r.status(), SurfaceStatus::Valid);
        r.shutdown();
    }

    #[test]
    fn test_suboptimal_acquire_still_presents() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().set_acquire_suboptimal();
        r.draw_frame().unwrap();
        assert_eq!(r.device().stats().presents, 1);
        r.shutdown();
    }

    #[test]
    fn test_resize_is_sticky_until_rebuilt() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().resize(1024, 768);
        r.notify_resized();
        assert!(r.is_resize_pending());

        r.draw_frame().unwrap();

        assert!(!r.is_resize_pending());
        assert_eq!((r.surface().extent.width, r.surface().extent.height), (1024, 768));
        r.shutdown();
    }

    #[test]
    fn test_undefined_surface_extent_follows_drawable() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().surface_support_mut().capabilities.current_extent =
            vk::Extent2D { width: u32::MAX, height: u32::MAX };
        r.device_mut().set_drawable_extent(vk::Extent2D { width: 1000, height: 5000 });
        r.notify_resized();

        r.draw_frame().unwrap();

        // Height clamps to the surface's 4096 maximum.
        assert_eq!((r.surface().extent.width, r.surface().extent.height), (1000, 4096));
        assert_eq!(r.device().stats().presents, 1);
        r.shutdown();
    }

    #[test]
    fn test_minimized_draw_is_noop() {
        let (mut r, _) = with_pipeline(4);
        r.notify_minimized(true);
        r.draw_frame().unwrap();
        assert_eq!(r.device().stats().acquires, 0);

        r.notify_minimized(false);
        r.draw_frame().unwrap();
        assert_eq!(r.device().stats().presents, 1);
        r.shutdown();
    }

    #[test]
    fn test_zero_extent_rebuild_suspends() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().resize(0, 0);
        r.notify_resized();

        r.draw_frame().unwrap();
        assert!(r.is_minimized());
        assert_eq!(r.status(), SurfaceStatus::Invalidated);
        assert!(r.surface().is_empty());
        assert_eq!(r.device().stats().acquires, 0);

        r.device_mut().resize(640, 480);
        r.notify_minimized(false);
        r.draw_frame().unwrap();
        assert_eq!(r.status(), SurfaceStatus::Valid);
        assert_eq!(r.device().stats().presents, 1);
        r.shutdown();
    }

    #[test]
    fn test_rebuild_failure_is_reported() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().fail_next(FailPoint::CreatePipeline, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        r.notify_resized();

        let err = r.draw_frame().unwrap_err();
        assert!(matches!(err, FrameError::SurfaceRebuild(RebuildError::Pipelines(_))));
        assert_eq!(r.status(), SurfaceStatus::Invalidated);

        let device = r.shutdown();
        assert_eq!(device.live_objects(), 0);
    }

    // ============================================================
    // Fatal errors
    // ============================================================

    #[test]
    fn test_device_lost_on_submit() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().fail_next(FailPoint::Submit, vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(r.draw_frame(), Err(FrameError::DeviceLost)));
        r.shutdown();
    }

    #[test]
    fn test_acquire_failure_is_fatal() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().fail_next(FailPoint::Acquire, vk::Result::ERROR_SURFACE_LOST_KHR);
        assert!(matches!(
            r.draw_frame(),
            Err(FrameError::AcquireFailed(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
        r.shutdown();
    }

    #[test]
    fn test_unknown_image_index_is_reported() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().force_next_image(7);

        let err = r.draw_frame().unwrap_err();
        assert!(matches!(err, FrameError::MissingCommandBuffer { image_index: 7, image_count: 3 }));
        assert_eq!(r.device().stats().submissions, 0);
        r.shutdown();
    }

    #[test]
    fn test_present_failure_is_fatal() {
        let (mut r, _) = with_pipeline(4);
        r.device_mut().fail_next(FailPoint::Present, vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(r.draw_frame(), Err(FrameError::PresentFailed(vk::Result::ERROR_DEVICE_LOST))));
        r.shutdown();
    }

    #[test]
    fn test_pool_exhaustion_through_pipeline() {
        let mut r = renderer(4);
        for i in 0..4 {
            r.insert_primitive(&quad(i)).unwrap();
        }
        assert!(matches!(r.insert_primitive(&quad(4)), Err(PoolError::Exhausted { capacity: 4 })));
        assert_eq!(r.pool().len(), 4);
        r.shutdown();
    }
}
