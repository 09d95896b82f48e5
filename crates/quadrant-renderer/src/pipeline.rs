//! Shader stages and the pipeline registry.
//!
//! Every registered pipeline keeps the shader stages it was compiled from,
//! so the whole set can be recompiled against a new render pass and extent
//! after the surface is rebuilt. Handles are stable across rebuilds.

use std::ffi::{CStr, CString};
use std::io::Cursor;

use ash::vk;
use log::{debug, info, warn};

use crate::error::{RegistryError, VkResultExt};
use crate::gpu::{CompiledPipeline, GpuDevice, PipelineDesc};

/// Programmable stage a shader module is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderKind::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// A shader module together with the stage and entry point it is used with.
#[derive(Clone, Debug)]
pub struct ShaderStage {
    kind: ShaderKind,
    module: vk::ShaderModule,
    entry_point: CString,
}

impl ShaderStage {
    /// Create a shader module from SPIR-V bytes.
    ///
    /// The byte stream must be a whole number of words and start with the
    /// SPIR-V magic number in either byte order.
    pub fn from_spirv<D: GpuDevice>(
        device: &mut D,
        kind: ShaderKind,
        spirv: &[u8],
        entry_point: &str,
    ) -> Result<Self, RegistryError> {
        let entry_point = CString::new(entry_point).map_err(|_| RegistryError::InvalidEntryPoint)?;

        let code = ash::util::read_spv(&mut Cursor::new(spirv))
            .map_err(|e| RegistryError::InvalidSpirv(e.to_string()))?;

        let module = device
            .create_shader_module(&code)
            .op("create shader module")
            .map_err(RegistryError::ShaderModule)?;

        debug!("created {:?} shader module ({} words)", kind, code.len());
        Ok(Self { kind, module, entry_point })
    }

    pub fn kind(&self) -> ShaderKind {
        self.kind
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    pub fn create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.kind.stage_flags())
            .module(self.module)
            .name(&self.entry_point)
    }

    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        device.destroy_shader_module(self.module);
    }
}

/// Stable handle of a registered pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineIndex(u32);

impl PipelineIndex {
    /// Never returned by a successful create.
    pub const INVALID: Self = Self(u32::MAX);

    pub fn index(self) -> u32 {
        self.0
    }
}

/// A registered pipeline: its shader stages and, while the surface is valid,
/// the compiled pipeline object.
#[derive(Debug)]
pub struct DrawablePipeline {
    stages: Vec<ShaderStage>,
    compiled: Option<CompiledPipeline>,
}

impl DrawablePipeline {
    /// `None` between `destroy_all` and the next `rebuild_all`.
    pub fn pipeline(&self) -> Option<vk::Pipeline> {
        self.compiled.map(|c| c.pipeline)
    }

    pub fn stages(&self) -> &[ShaderStage] {
        &self.stages
    }

    fn compile<D: GpuDevice>(
        &mut self,
        device: &mut D,
        handle: u32,
        extent: vk::Extent2D,
        render_pass: vk::RenderPass,
    ) -> Result<(), RegistryError> {
        if let Some(old) = self.compiled.take() {
            device.destroy_pipeline(old);
        }
        let compiled = device
            .create_graphics_pipeline(&PipelineDesc { stages: &self.stages, extent, render_pass })
            .op("create graphics pipeline")
            .map_err(|source| RegistryError::Compile { handle, source })?;
        self.compiled = Some(compiled);
        Ok(())
    }
}

/// Ceiling-bounded set of pipelines addressed by [`PipelineIndex`].
pub struct PipelineRegistry {
    slots: Vec<Option<DrawablePipeline>>,
    next_handle: usize,
    count: usize,
}

impl PipelineRegistry {
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: (0..ceiling).map(|_| None).collect(),
            next_handle: 0,
            count: 0,
        }
    }

    /// Register a pipeline built from a vertex and a fragment stage.
    ///
    /// Compiles immediately when `render_pass` is a live render pass. With a
    /// null render pass (no surface yet) the stages are only recorded and
    /// the pipeline is compiled by the next `rebuild_all`.
    pub fn create<D: GpuDevice>(
        &mut self,
        device: &mut D,
        vertex: &ShaderStage,
        fragment: &ShaderStage,
        extent: vk::Extent2D,
        render_pass: vk::RenderPass,
    ) -> Result<PipelineIndex, RegistryError> {
        let ceiling = self.ceiling();
        if self.count >= ceiling {
            warn!("pipeline registry full ({} pipelines), create rejected", ceiling);
            return Err(RegistryError::Full { ceiling });
        }

        let mut slot = self.next_handle;
        while self.slots[slot].is_some() {
            slot = (slot + 1) % ceiling;
        }

        let mut entry = DrawablePipeline { stages: vec![vertex.clone(), fragment.clone()], compiled: None };
        if render_pass != vk::RenderPass::null() {
            entry.compile(device, slot as u32, extent, render_pass)?;
        }

        self.slots[slot] = Some(entry);
        self.count += 1;
        self.next_handle = (slot + 1) % ceiling;

        debug!("registered pipeline {}", slot);
        Ok(PipelineIndex(slot as u32))
    }

    /// Recompile every registered pipeline against a new render pass and
    /// extent. Handles are unchanged.
    pub fn rebuild_all<D: GpuDevice>(
        &mut self,
        device: &mut D,
        extent: vk::Extent2D,
        render_pass: vk::RenderPass,
    ) -> Result<(), RegistryError> {
        for (handle, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot {
                entry.compile(device, handle as u32, extent, render_pass)?;
            }
        }
        if self.count > 0 {
            info!("rebuilt {} pipelines for {}x{}", self.count, extent.width, extent.height);
        }
        Ok(())
    }

    pub fn lookup(&self, handle: PipelineIndex) -> Option<&DrawablePipeline> {
        self.slots.get(handle.0 as usize).and_then(Option::as_ref)
    }

    /// Destroy every compiled pipeline object, keeping the shader stages for
    /// the next `rebuild_all`.
    pub fn destroy_all<D: GpuDevice>(&mut self, device: &mut D) {
        for entry in self.slots.iter_mut().flatten() {
            if let Some(compiled) = entry.compiled.take() {
                device.destroy_pipeline(compiled);
            }
        }
    }

    /// Unregister a single pipeline and free its handle for reuse.
    pub fn remove<D: GpuDevice>(&mut self, device: &mut D, handle: PipelineIndex) -> Result<(), RegistryError> {
        let entry = self
            .slots
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .ok_or(RegistryError::UnknownHandle(handle.0))?;

        if let Some(compiled) = entry.compiled {
            device.destroy_pipeline(compiled);
        }
        self.count -= 1;
        debug!("removed pipeline {}", handle.0);
        Ok(())
    }

    /// Unregister everything.
    pub fn clear<D: GpuDevice>(&mut self, device: &mut D) {
        self.destroy_all(device);
        for slot in &mut self.slots {
            *slot = None;
        }
        self.count = 0;
        self.next_handle = 0;
    }

    pub fn handles(&self) -> impl Iterator<Item = PipelineIndex> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| PipelineIndex(i as u32))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn ceiling(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{FailPoint, HeadlessDevice};

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn spirv_bytes() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0].iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    struct Fixture {
        device: HeadlessDevice,
        vertex: ShaderStage,
        fragment: ShaderStage,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    }

    fn fixture() -> Fixture {
        let mut device = HeadlessDevice::new();
        let vertex = ShaderStage::from_spirv(&mut device, ShaderKind::Vertex, &spirv_bytes(), "main").unwrap();
        let fragment = ShaderStage::from_spirv(&mut device, ShaderKind::Fragment, &spirv_bytes(), "main").unwrap();
        let render_pass = device.create_render_pass(vk::Format::B8G8R8A8_UNORM).unwrap();
        Fixture { device, vertex, fragment, render_pass, extent: vk::Extent2D { width: 640, height: 480 } }
    }

    // ============================================================
    // Shader stages
    // ============================================================

    #[test]
    fn test_stage_flags() {
        assert_eq!(ShaderKind::Vertex.stage_flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderKind::Fragment.stage_flags(), vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_from_spirv_rejects_truncated_bytes() {
        let mut device = HeadlessDevice::new();
        let mut bytes = spirv_bytes();
        bytes.pop();
        let err = ShaderStage::from_spirv(&mut device, ShaderKind::Vertex, &bytes, "main").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpirv(_)));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_entry_point_with_nul_rejected() {
        let mut device = HeadlessDevice::new();
        let err = ShaderStage::from_spirv(&mut device, ShaderKind::Fragment, &spirv_bytes(), "ma\0in").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidEntryPoint));
    }

    #[test]
    fn test_create_info_carries_entry_point() {
        let mut f = fixture();
        let info = f.vertex.create_info();
        assert_eq!(info.stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(info.module, f.vertex.module());
        assert_eq!(f.vertex.entry_point().to_str().unwrap(), "main");
        f.vertex.destroy(&mut f.device);
    }

    // ============================================================
    // Registry
    // ============================================================

    #[test]
    fn test_create_assigns_distinct_handles() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(4);
        let a = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        let b = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(a).unwrap().pipeline().is_some());
        assert!(registry.lookup(PipelineIndex::INVALID).is_none());

        let kinds: Vec<ShaderKind> = registry.lookup(b).unwrap().stages().iter().map(ShaderStage::kind).collect();
        assert_eq!(kinds, vec![ShaderKind::Vertex, ShaderKind::Fragment]);
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(2);
        let first = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        let second = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        assert_eq!(first, PipelineIndex(0));
        assert_eq!(second, PipelineIndex(1));

        let err = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap_err();
        assert!(matches!(err, RegistryError::Full { ceiling: 2 }));
        assert_eq!(registry.len(), 2);
        assert_eq!(f.device.stats().pipelines_created, 2);
    }

    #[test]
    fn test_removed_handle_is_reused() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(2);
        let a = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        let _b = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();

        registry.remove(&mut f.device, a).unwrap();
        assert!(registry.lookup(a).is_none());
        let c = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        assert_eq!(c, a);
        assert!(matches!(
            registry.remove(&mut f.device, PipelineIndex::INVALID),
            Err(RegistryError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_rebuild_all_keeps_handles() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(8);
        let handles: Vec<PipelineIndex> = (0..3)
            .map(|_| registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap())
            .collect();
        let before: Vec<vk::Pipeline> = handles.iter().map(|&h| registry.lookup(h).unwrap().pipeline().unwrap()).collect();

        registry.destroy_all(&mut f.device);
        assert!(handles.iter().all(|&h| registry.lookup(h).unwrap().pipeline().is_none()));
        assert!(before.iter().all(|&p| !f.device.pipeline_exists(p)));

        let new_pass = f.device.create_render_pass(vk::Format::B8G8R8A8_UNORM).unwrap();
        registry.rebuild_all(&mut f.device, vk::Extent2D { width: 1024, height: 768 }, new_pass).unwrap();

        assert_eq!(registry.handles().collect::<Vec<_>>(), handles);
        for (&h, &old) in handles.iter().zip(&before) {
            let rebuilt = registry.lookup(h).unwrap().pipeline().unwrap();
            assert_ne!(rebuilt, old);
            assert!(f.device.pipeline_exists(rebuilt));
        }
    }

    #[test]
    fn test_rebuild_failure_names_handle() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(4);
        let handle = registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        registry.destroy_all(&mut f.device);

        f.device.fail_next(FailPoint::CreatePipeline, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = registry.rebuild_all(&mut f.device, f.extent, f.render_pass).unwrap_err();
        assert!(matches!(err, RegistryError::Compile { handle: h, .. } if h == handle.index()));
    }

    #[test]
    fn test_create_without_render_pass_defers_compile() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(4);
        let handle = registry
            .create(&mut f.device, &f.vertex, &f.fragment, f.extent, vk::RenderPass::null())
            .unwrap();
        assert!(registry.lookup(handle).unwrap().pipeline().is_none());
        assert_eq!(f.device.stats().pipelines_created, 0);

        registry.rebuild_all(&mut f.device, f.extent, f.render_pass).unwrap();
        assert!(registry.lookup(handle).unwrap().pipeline().is_some());
    }

    #[test]
    fn test_clear_destroys_everything() {
        let mut f = fixture();
        let mut registry = PipelineRegistry::new(4);
        for _ in 0..3 {
            registry.create(&mut f.device, &f.vertex, &f.fragment, f.extent, f.render_pass).unwrap();
        }
        registry.clear(&mut f.device);
        assert!(registry.is_empty());

        f.vertex.destroy(&mut f.device);
        f.fragment.destroy(&mut f.device);
        f.device.destroy_render_pass(f.render_pass);
        assert_eq!(f.device.live_objects(), 0);
    }
}
